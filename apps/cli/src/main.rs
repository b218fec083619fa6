//! tunnelkeeper CLI
//!
//! Runs the lifecycle daemon and sends it control commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use tunnelkeeper_core::{RecoveryMode, StateSnapshot, StubEngine, SwitchResult};
use tunnelkeeper_daemon::{CoordinatorConfig, DaemonService, IpcServer, SysfsNetworkProvider};
use tunnelkeeper_ipc_client::{
    default_socket_path, IpcClient, StartOutcome, StateWatcher, StopOutcome, SysfsTunnelPresence,
    WatchConfig,
};
use tunnelkeeper_logging::{init, init_with_config, LogConfig, LogLevel};
use tunnelkeeper_store::{default_state_dir, StateStore};

/// tunnelkeeper - tunnel lifecycle coordinator
#[derive(Parser)]
#[command(name = "tunnelkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Socket path for daemon communication
    #[arg(long, env = "TUNNELKEEPER_SOCKET", global = true)]
    socket: Option<PathBuf>,

    /// Increase logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (usually started by the system service manager)
    Daemon {
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory of the durable state store
        #[arg(long, env = "TUNNELKEEPER_STATE_DIR")]
        state_dir: Option<PathBuf>,
    },

    /// Start the tunnel
    Start {
        /// Tunnel engine configuration file
        config: PathBuf,
    },

    /// Stop the tunnel
    Stop {
        /// Stop without suppressing automatic recovery
        #[arg(long)]
        auto: bool,
    },

    /// Switch the active outbound
    Switch {
        /// Outbound tag to select
        #[arg(conflicts_with = "next", required_unless_present = "next")]
        tag: Option<String>,

        /// Select the outbound after the current one
        #[arg(long)]
        next: bool,
    },

    /// Reset all tunnel connections
    ResetConnections,

    /// Nudge the network path (escalating recovery)
    Bump {
        #[arg(long)]
        reason: Option<String>,
    },

    /// Announce an imminent restart so apps drop their connections
    PrepareRestart {
        reason: Option<String>,
    },

    /// Reload the engine configuration without restarting
    HotReload {
        /// Configuration file whose content is sent to the engine
        file: PathBuf,
    },

    /// Stop and start again with a new configuration
    Restart {
        config: PathBuf,
    },

    /// Run one network recovery step
    Recover {
        #[arg(value_enum)]
        mode: ModeArg,
    },

    /// Forward a foreground/background or device-idle hint
    Hint {
        #[arg(value_enum)]
        hint: HintArg,
    },

    /// Show daemon status
    Status,

    /// Follow state changes until interrupted
    Watch {
        /// Durable state directory used while the daemon is unreachable
        #[arg(long, env = "TUNNELKEEPER_STATE_DIR")]
        state_dir: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Quick,
    Full,
    Deep,
    Proactive,
    Auto,
}

impl From<ModeArg> for RecoveryMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Quick => RecoveryMode::Quick,
            ModeArg::Full => RecoveryMode::Full,
            ModeArg::Deep => RecoveryMode::Deep,
            ModeArg::Proactive => RecoveryMode::Proactive,
            ModeArg::Auto => RecoveryMode::Auto,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum HintArg {
    Foreground,
    Background,
    Idle,
    Active,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket = cli.socket.clone().unwrap_or_else(default_socket_path);

    match cli.command {
        Commands::Daemon { config, state_dir } => {
            init_with_config(&LogConfig {
                level: LogLevel::Info.louder(cli.verbose),
                show_target: cli.verbose > 0,
                ansi: true,
            });
            run_daemon(cli.socket, config, state_dir).await?;
        }
        command => {
            init(LogLevel::Warn.louder(cli.verbose));
            run_command(&socket, command).await?;
        }
    }

    Ok(())
}

async fn run_command(socket: &Path, command: Commands) -> Result<()> {
    let client = IpcClient::new(socket.to_path_buf());
    match command {
        Commands::Start { config } => start(&client, config).await,
        Commands::Stop { auto } => stop(&client, !auto).await,
        Commands::Switch { tag, .. } => switch(&client, tag).await,
        Commands::ResetConnections => {
            let accepted = client.reset_connections(None).await.context(daemon_hint(socket))?;
            report_accepted("Connection reset", accepted);
            Ok(())
        }
        Commands::Bump { reason } => {
            let accepted = client.network_bump(reason).await.context(daemon_hint(socket))?;
            report_accepted("Network bump", accepted);
            Ok(())
        }
        Commands::PrepareRestart { reason } => {
            let accepted = client.prepare_restart(reason).await.context(daemon_hint(socket))?;
            report_accepted("Prepare-restart", accepted);
            Ok(())
        }
        Commands::HotReload { file } => hot_reload(&client, &file).await,
        Commands::Restart { config } => {
            let config = absolute(config)?;
            client.full_restart(config.clone()).await.context(daemon_hint(socket))?;
            println!("Tunnel restarted with {}", config.display());
            Ok(())
        }
        Commands::Recover { mode } => {
            let mode = RecoveryMode::from(mode);
            let accepted = client.recover(mode, None).await.context(daemon_hint(socket))?;
            report_accepted(&format!("Recover ({})", mode), accepted);
            Ok(())
        }
        Commands::Hint { hint } => {
            let accepted = match hint {
                HintArg::Foreground => client.app_lifecycle(true).await,
                HintArg::Background => client.app_lifecycle(false).await,
                HintArg::Idle => client.device_idle(true).await,
                HintArg::Active => client.device_idle(false).await,
            }
            .context(daemon_hint(socket))?;
            report_accepted("Hint", accepted);
            Ok(())
        }
        Commands::Status => status(&client).await,
        Commands::Watch { state_dir } => watch(socket, state_dir).await,
        Commands::Daemon { .. } => unreachable!("daemon is dispatched in main"),
    }
}

fn daemon_hint(socket: &Path) -> String {
    format!("Failed to reach daemon at {}", socket.display())
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().context("Failed to resolve current directory")?;
    Ok(cwd.join(path))
}

fn report_accepted(what: &str, accepted: bool) {
    if accepted {
        println!("{} requested", what);
    } else {
        println!("{} not accepted (tunnel not running or throttled)", what);
    }
}

// ============================================================================
// Control commands
// ============================================================================

async fn start(client: &IpcClient, config: PathBuf) -> Result<()> {
    let config = absolute(config)?;
    let outcome = client
        .start(config.clone())
        .await
        .context(daemon_hint(client.socket_path()))?;
    match outcome {
        StartOutcome::Started => println!("Starting tunnel with {}", config.display()),
        StartOutcome::AlreadyActive => println!("Tunnel is already starting or running"),
        StartOutcome::Queued => println!("Tunnel is stopping; start queued"),
    }
    Ok(())
}

async fn stop(client: &IpcClient, manual: bool) -> Result<()> {
    let outcome = client
        .stop(manual)
        .await
        .context(daemon_hint(client.socket_path()))?;
    match outcome {
        StopOutcome::Stopped => println!("Tunnel stopped"),
        StopOutcome::AlreadyStopping => println!("Tunnel is already stopping"),
        StopOutcome::AlreadyStopped => println!("Tunnel is not running"),
    }
    Ok(())
}

async fn switch(client: &IpcClient, tag: Option<String>) -> Result<()> {
    let result = client
        .switch_node(tag)
        .await
        .context(daemon_hint(client.socket_path()))?;
    let target = result.target.unwrap_or_default();
    match result.result {
        SwitchResult::Success => println!("Switched to {}", target),
        SwitchResult::NeedRestart => println!("Switching to {} (tunnel restarting)", target),
        SwitchResult::Failed => bail!("Switch to {} failed", target),
    }
    Ok(())
}

async fn hot_reload(client: &IpcClient, file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let reply = client
        .hot_reload(content)
        .await
        .context(daemon_hint(client.socket_path()))?;
    println!("Hot reload: {:?} (code {})", reply.result, reply.code);
    Ok(())
}

async fn status(client: &IpcClient) -> Result<()> {
    let result = client
        .status()
        .await
        .context(daemon_hint(client.socket_path()))?;

    println!("tunnelkeeper Status");
    println!("===================");
    println!("State:            {}", result.state);
    if !result.active_label.is_empty() {
        println!("Outbound:         {}", result.active_label);
    }
    if !result.last_error.is_empty() {
        println!("Last error:       {}", result.last_error);
    }
    println!("Manually stopped: {}", result.manually_stopped);
    if let Some(path) = &result.config_path {
        println!("Config:           {}", path.display());
    }
    if let Some(uptime) = result.uptime_secs {
        println!("Uptime:           {}", format_duration(Duration::from_secs(uptime)));
    }
    if let Some(iface) = &result.underlying_interface {
        println!("Uplink:           {}", iface);
    }
    println!(
        "Traffic:          {} up / {} down",
        format_rate(result.upload_bps),
        format_rate(result.download_bps)
    );
    println!("Stall refreshes:  {}", result.stall_refresh_attempts);
    println!("Subscribers:      {}", result.subscribers);
    Ok(())
}

async fn watch(socket: &Path, state_dir: Option<PathBuf>) -> Result<()> {
    let store = match StateStore::open(state_dir.unwrap_or_else(default_state_dir)) {
        Ok(store) => Some(store),
        Err(e) => {
            warn!("Durable state unavailable: {}", e);
            None
        }
    };
    let watcher = StateWatcher::with_fallbacks(
        socket,
        WatchConfig::default(),
        Some(Arc::new(SysfsTunnelPresence::default())),
        store,
    );
    let mut rx = watcher.subscribe();
    watcher.bind();

    print_snapshot(&rx.borrow_and_update());
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut reported_degraded = false;

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                print_snapshot(&rx.borrow_and_update());
            }
            _ = ticker.tick() => {
                let degraded = watcher.is_degraded();
                if degraded && !reported_degraded {
                    eprintln!("Daemon unreachable at {}; showing last known state", socket.display());
                }
                reported_degraded = degraded;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    watcher.unbind();
    Ok(())
}

fn print_snapshot(snapshot: &StateSnapshot) {
    let mut line = format!("[v{}] {}", snapshot.version, snapshot.state);
    if !snapshot.active_label.is_empty() {
        line.push_str(&format!(" via {}", snapshot.active_label));
    }
    if snapshot.manually_stopped {
        line.push_str(" (manually stopped)");
    }
    if !snapshot.last_error.is_empty() {
        line.push_str(&format!(" error: {}", snapshot.last_error));
    }
    println!("{}", line);
}

fn format_rate(bps: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bps >= MB {
        format!("{:.2} MB/s", bps as f64 / MB as f64)
    } else if bps >= KB {
        format!("{:.2} KB/s", bps as f64 / KB as f64)
    } else {
        format!("{} B/s", bps)
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

// ============================================================================
// Daemon
// ============================================================================

async fn run_daemon(
    socket: Option<PathBuf>,
    config_file: Option<PathBuf>,
    state_dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = match &config_file {
        Some(path) => CoordinatorConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => CoordinatorConfig::default(),
    };
    if let Some(socket) = socket {
        config.ipc.socket_path = socket;
    }
    if state_dir.is_some() {
        config.state_dir = state_dir;
    }
    config.validate().context("Invalid configuration")?;

    let state_dir = config.state_dir.clone().unwrap_or_else(default_state_dir);
    let store = StateStore::open(&state_dir)
        .with_context(|| format!("Failed to open state store at {}", state_dir.display()))?;

    info!("Starting tunnelkeeper daemon...");
    info!("State directory: {:?}", state_dir);
    warn!("No platform tunnel engine linked; using the in-memory engine");

    let engine = Arc::new(StubEngine::new());
    let provider = Arc::new(SysfsNetworkProvider::from_config(&config.network));
    let service = DaemonService::new(config.clone(), engine, provider, Some(store));

    let mut server = IpcServer::new(config.ipc.clone());
    server.set_state_hub(service.hub());
    let shutdown = server.shutdown_handle();
    let handler = service.clone();
    let mut server_task = tokio::spawn(async move { server.start(handler).await });

    tokio::select! {
        result = &mut server_task => {
            service.shutdown().await;
            result.context("IPC server task panicked")?.context("IPC server failed")?;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    let _ = shutdown.send(()).await;
    match server_task.await {
        Ok(Err(e)) => warn!("IPC server stopped with error: {}", e),
        Err(e) => warn!("IPC server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    service.shutdown().await;
    info!("Daemon stopped");

    Ok(())
}
