//! Daemon service implementation
//!
//! Owns the STOPPED → STARTING → RUNNING → STOPPING state machine and the
//! engine handle. State flips happen under one short lock and are published
//! to the hub while it is held, so observers see transitions in order. The
//! hub writes the durable store later, off this lock.
//!
//! Each run gets a child cancellation token. The network monitor, the stall
//! sampler and the stall policy task live under it and are cancelled
//! together when the run ends.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnelkeeper_core::protocol::{
    methods, AcceptedResult, AppLifecycleParams, DeviceIdleParams, HotReloadParams,
    HotReloadReply, ReasonParams, RecoverParams, StartParams, StartOutcome, StartResult,
    StatusResult, StopOutcome, StopParams, StopResult, SwitchNodeParams, SwitchNodeResult,
};
use tunnelkeeper_core::{
    EngineError, EngineHandle, HotReloadResult, NetworkSnapshot, RecoveryMode,
    RecoveryRequest, ServiceState, SnapshotPatch, StateSnapshot, SwitchResult, SwitchTarget,
    TrafficTotals, TunnelEngine, TunnelOptions,
};
use tunnelkeeper_store::StateStore;

use crate::config::CoordinatorConfig;
use crate::hub::StateHub;
use crate::ipc::IpcHandler;
use crate::network::{NetworkMonitor, NetworkProvider, UnderlyingNetworkSink};
use crate::recovery::{RecoveryCoordinator, RecoveryHooks, RecoveryRequester};
use crate::stall::{StallEvent, TrafficRates, TrafficSource, TrafficStallDetector};
use crate::{DaemonError, Result};

// ============================================================================
// Stall policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallAction {
    None,
    /// Wake the engine and request a full network recovery
    Refresh { attempt: u32 },
    Restart,
}

/// Caller-side escalation for stall signals: a bounded number of refreshes,
/// then a restart. A flowing checkpoint clears the attempt count.
#[derive(Debug, Clone)]
pub struct StallPolicy {
    attempts: u32,
    max_attempts: u32,
}

impl StallPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { attempts: 0, max_attempts }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_event(&mut self, event: StallEvent, manually_stopped: bool) -> StallAction {
        match event {
            StallEvent::Flowing => {
                if self.attempts > 0 {
                    info!("Traffic flowing again after {} refresh attempts", self.attempts);
                }
                self.attempts = 0;
                StallAction::None
            }
            StallEvent::Stalled { .. } if manually_stopped => StallAction::None,
            StallEvent::Stalled { consecutive_count } => {
                if self.attempts < self.max_attempts {
                    self.attempts += 1;
                    debug!(
                        "Stall (windows: {}), refresh attempt {}/{}",
                        consecutive_count, self.attempts, self.max_attempts
                    );
                    StallAction::Refresh { attempt: self.attempts }
                } else {
                    self.attempts = 0;
                    StallAction::Restart
                }
            }
        }
    }
}

/// Outbound following `current` in `outbounds`, wrapping around.
fn next_outbound(outbounds: &[String], current: Option<&str>) -> Option<String> {
    if outbounds.is_empty() {
        return None;
    }
    let next = current
        .and_then(|tag| outbounds.iter().position(|o| o == tag))
        .map_or(0, |i| (i + 1) % outbounds.len());
    outbounds.get(next).cloned()
}

// ============================================================================
// Engine adapters
// ============================================================================

struct EngineLink(Arc<dyn TunnelEngine>);

impl UnderlyingNetworkSink for EngineLink {
    fn set_underlying_network(&self, network: Option<&NetworkSnapshot>) {
        self.0.set_underlying_network(network);
    }
}

impl TrafficSource for EngineLink {
    fn traffic_totals(&self) -> TrafficTotals {
        self.0.traffic_totals()
    }
}

// ============================================================================
// Service state
// ============================================================================

/// Components that exist only while a tunnel run is active.
struct RunContext {
    token: CancellationToken,
    monitor: Arc<NetworkMonitor>,
    detector: Arc<TrafficStallDetector>,
    policy: Arc<Mutex<StallPolicy>>,
}

impl Drop for RunContext {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[derive(Default)]
struct Lifecycle {
    state: ServiceState,
    /// Bumped by every start and stop; a start only commits if it is still current.
    op_id: u64,
    config_path: Option<PathBuf>,
    pending_start: Option<PathBuf>,
    start_cancel: Option<CancellationToken>,
    handle: Option<EngineHandle>,
    started_at: Option<Instant>,
    run: Option<RunContext>,
}

#[derive(Default)]
struct AppState {
    background_since: Option<Instant>,
    last_foreground_recovery: Option<Instant>,
}

struct ServiceInner {
    config: CoordinatorConfig,
    engine: Arc<dyn TunnelEngine>,
    provider: Arc<dyn NetworkProvider>,
    store: Option<StateStore>,
    hub: Arc<StateHub>,
    recovery: RecoveryCoordinator,
    root: CancellationToken,
    closing: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    app: Mutex<AppState>,
    last_prepare_restart: Mutex<Option<Instant>>,
}

/// Daemon service
#[derive(Clone)]
pub struct DaemonService {
    inner: Arc<ServiceInner>,
}

impl DaemonService {
    pub fn new(
        config: CoordinatorConfig,
        engine: Arc<dyn TunnelEngine>,
        provider: Arc<dyn NetworkProvider>,
        store: Option<StateStore>,
    ) -> Self {
        let manually_stopped = match &store {
            Some(store) => {
                if let Err(e) = store.clear_runtime() {
                    warn!("Failed to reset durable runtime state: {}", e);
                }
                store.is_manually_stopped().unwrap_or_else(|e| {
                    warn!("Failed to read manual-stop flag: {}", e);
                    false
                })
            }
            None => false,
        };
        let initial = StateSnapshot { manually_stopped, ..StateSnapshot::default() };
        let hub = match &store {
            Some(store) => StateHub::with_store(initial, store.clone()),
            None => StateHub::new(initial),
        };

        let root = CancellationToken::new();
        let inner = Arc::new_cyclic(|weak: &Weak<ServiceInner>| {
            let hooks = Arc::new(ServiceHooks { inner: weak.clone() });
            let recovery =
                RecoveryCoordinator::with_token(config.recovery.clone(), hooks, root.child_token());
            ServiceInner {
                config,
                engine,
                provider,
                store,
                hub,
                recovery,
                root,
                closing: AtomicBool::new(false),
                lifecycle: Mutex::new(Lifecycle::default()),
                app: Mutex::new(AppState::default()),
                last_prepare_restart: Mutex::new(None),
            }
        });

        Self { inner }
    }

    pub fn hub(&self) -> Arc<StateHub> {
        self.inner.hub.clone()
    }

    pub fn recovery(&self) -> &RecoveryCoordinator {
        &self.inner.recovery
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.hub.snapshot()
    }

    /// Begin a start. The engine is brought up in the background.
    pub fn start(&self, config_path: PathBuf) -> StartOutcome {
        let outcome = self.inner.begin_start(config_path).0;
        if outcome != StartOutcome::AlreadyActive {
            self.inner.set_manually_stopped(false);
        }
        outcome
    }

    /// Start and wait for the outcome. Fails with the recorded start error.
    pub async fn start_and_wait(&self, config_path: PathBuf) -> Result<()> {
        self.inner.set_manually_stopped(false);
        self.inner.start_and_wait(config_path).await
    }

    pub async fn stop(&self, manual: bool) -> StopOutcome {
        self.inner.stop(manual).await
    }

    pub async fn restart(&self, reason: &str) -> Result<()> {
        self.inner.restart(reason).await
    }

    pub async fn full_restart(&self, config_path: PathBuf) -> Result<()> {
        self.inner.set_manually_stopped(false);
        self.inner.full_restart(config_path).await
    }

    pub async fn switch_node(&self, target: SwitchTarget) -> Result<SwitchNodeResult> {
        self.inner.switch_node(target).await
    }

    pub async fn hot_reload(&self, config_content: &str) -> HotReloadResult {
        self.inner.hot_reload(config_content).await
    }

    pub async fn prepare_restart(&self, reason: &str) -> bool {
        self.inner.prepare_restart(reason).await
    }

    pub fn reset_connections(&self, reason: &str) -> bool {
        self.inner
            .request_if_running(RecoveryRequest::reset_connections(reason, true))
    }

    pub fn network_bump(&self, reason: &str) -> bool {
        self.inner.request_if_running(RecoveryRequest::network_bump(reason))
    }

    pub fn recover(&self, mode: RecoveryMode, reason: &str) -> bool {
        self.inner.request_if_running(RecoveryRequest::recover(mode, reason))
    }

    pub fn on_app_lifecycle(&self, foreground: bool) -> bool {
        self.inner.on_app_lifecycle(foreground)
    }

    pub fn on_device_idle(&self, idle: bool) -> bool {
        self.inner.on_device_idle(idle)
    }

    pub fn status(&self) -> StatusResult {
        self.inner.status()
    }

    /// Stop the tunnel and cancel every background task.
    pub async fn shutdown(&self) {
        info!("Daemon service shutting down");
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.recovery.shutdown();
        self.inner.recovery.wait_idle().await;
        self.inner.stop(false).await;
        self.inner.root.cancel();
        self.inner.hub.flushed().await;
    }
}

impl ServiceInner {
    fn state(&self) -> ServiceState {
        self.lifecycle.lock().state
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn is_manually_stopped(&self) -> bool {
        self.hub.snapshot().manually_stopped
    }

    fn set_manually_stopped(&self, value: bool) {
        if self.is_manually_stopped() != value {
            info!("Manual stop flag -> {}", value);
            self.hub.update(SnapshotPatch::new().manually_stopped(value));
        }
    }

    fn run_monitor(&self) -> Option<Arc<NetworkMonitor>> {
        self.lifecycle.lock().run.as_ref().map(|run| run.monitor.clone())
    }

    /// Flip the state and publish it. Called with the lifecycle lock held.
    fn transition(&self, lc: &mut Lifecycle, state: ServiceState, patch: SnapshotPatch) {
        debug!("Service state {} -> {}", lc.state, state);
        lc.state = state;
        self.hub.update(patch.state(state));
    }

    fn begin_start(
        self: &Arc<Self>,
        config_path: PathBuf,
    ) -> (StartOutcome, Option<JoinHandle<Result<()>>>) {
        let (op_id, cancel) = {
            let mut lc = self.lifecycle.lock();
            match lc.state {
                ServiceState::Starting | ServiceState::Running => {
                    info!("Start ignored: tunnel already {}", lc.state);
                    return (StartOutcome::AlreadyActive, None);
                }
                ServiceState::Stopping => {
                    info!("Stop in progress, queueing start with {:?}", config_path);
                    lc.pending_start = Some(config_path);
                    return (StartOutcome::Queued, None);
                }
                ServiceState::Stopped => {}
            }
            lc.op_id += 1;
            let cancel = self.root.child_token();
            lc.start_cancel = Some(cancel.clone());
            lc.config_path = Some(config_path.clone());
            self.transition(&mut lc, ServiceState::Starting, SnapshotPatch::new().last_error(""));
            (lc.op_id, cancel)
        };

        info!("Starting tunnel with {:?}", config_path);
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move { inner.run_start(op_id, config_path, cancel).await });
        (StartOutcome::Started, Some(task))
    }

    async fn start_and_wait(self: &Arc<Self>, config_path: PathBuf) -> Result<()> {
        match self.begin_start(config_path) {
            (StartOutcome::Started, Some(task)) => task.await.map_err(|_| DaemonError::Cancelled)?,
            (outcome, _) => {
                debug!("Start not performed: {:?}", outcome);
                Ok(())
            }
        }
    }

    async fn run_start(
        self: Arc<Self>,
        op_id: u64,
        config_path: PathBuf,
        cancel: CancellationToken,
    ) -> Result<()> {
        let result = self.bring_up(op_id, &config_path, &cancel).await;
        if let Err(e) = &result {
            let mut lc = self.lifecycle.lock();
            if lc.op_id == op_id && lc.state == ServiceState::Starting {
                error!("Tunnel start failed: {}", e);
                lc.start_cancel = None;
                self.transition(
                    &mut lc,
                    ServiceState::Stopped,
                    SnapshotPatch::new().last_error(e.to_string()).active_label(""),
                );
            } else {
                debug!("Superseded start ended: {}", e);
            }
        }
        result
    }

    async fn bring_up(
        self: &Arc<Self>,
        op_id: u64,
        config_path: &PathBuf,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let config = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            DaemonError::StartFailure(format!("cannot read {}: {}", config_path.display(), e))
        })?;

        let handle = tokio::select! {
            _ = cancel.cancelled() => return Err(DaemonError::Cancelled),
            started = self.engine.start(&config) => {
                started.map_err(|e| DaemonError::StartFailure(e.to_string()))?
            }
        };

        if self.lifecycle.lock().op_id != op_id {
            self.close_engine(handle).await;
            return Err(DaemonError::Cancelled);
        }

        let options = TunnelOptions {
            mtu: self.config.lifecycle.tunnel_mtu,
            addresses: self.config.lifecycle.tunnel_addresses.clone(),
            auto_route: true,
        };
        if let Err(e) = self.engine.open_tunnel_descriptor(&options).await {
            self.close_engine(handle).await;
            return Err(DaemonError::StartFailure(format!("tunnel interface: {}", e)));
        }

        let run = self.new_run();
        let label = self.engine.selected_outbound().unwrap_or_default();
        let committed = {
            let mut lc = self.lifecycle.lock();
            if lc.op_id == op_id && lc.state == ServiceState::Starting {
                lc.handle = Some(handle);
                lc.started_at = Some(Instant::now());
                lc.start_cancel = None;
                lc.run = Some(run);
                self.transition(
                    &mut lc,
                    ServiceState::Running,
                    SnapshotPatch::new().active_label(label.clone()),
                );
                true
            } else {
                drop(run);
                false
            }
        };

        if !committed {
            self.close_engine(handle).await;
            return Err(DaemonError::Cancelled);
        }
        info!("Tunnel running (outbound: {:?})", label);
        Ok(())
    }

    /// Fresh monitor, sampler and stall policy bound to a new run token.
    fn new_run(self: &Arc<Self>) -> RunContext {
        let token = self.root.child_token();
        let link = Arc::new(EngineLink(self.engine.clone()));
        let requester: Arc<dyn RecoveryRequester> = Arc::new(self.recovery.clone());

        let monitor = Arc::new(
            NetworkMonitor::new(self.config.network.clone(), self.provider.clone(), link.clone())
                .with_recovery(requester),
        );
        if monitor.mark_tunnel_started().is_none() {
            warn!("No physical network available at tunnel start");
        }
        monitor.spawn(token.child_token());

        let detector = TrafficStallDetector::new(&self.config.stall, link);
        let policy = Arc::new(Mutex::new(StallPolicy::new(self.config.stall.max_refresh_attempts)));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        detector.spawn(token.child_token(), events_tx);
        self.spawn_stall_policy(token.child_token(), events_rx, detector.clone(), policy.clone());

        RunContext { token, monitor, detector, policy }
    }

    fn spawn_stall_policy(
        self: &Arc<Self>,
        token: CancellationToken,
        mut events: mpsc::UnboundedReceiver<StallEvent>,
        detector: Arc<TrafficStallDetector>,
        policy: Arc<Mutex<StallPolicy>>,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let action = policy.lock().on_event(event, inner.is_manually_stopped());
                match action {
                    StallAction::None => {}
                    StallAction::Refresh { attempt } => {
                        inner.engine.wake();
                        inner.recovery.request(RecoveryRequest::recover(
                            RecoveryMode::Full,
                            format!("traffic_stall_refresh_{}", attempt),
                        ));
                        detector.reset_stall_counter();
                    }
                    StallAction::Restart => {
                        warn!("Stall persisted after refresh attempts, restarting");
                        detector.reset_stall_counter();
                        inner.recovery.request(RecoveryRequest::restart("traffic_stall"));
                    }
                }
            }
            debug!("Stall policy task stopped");
        });
    }

    async fn close_engine(&self, handle: EngineHandle) {
        if let Err(e) = self.engine.close(handle).await {
            warn!("Engine close failed: {}", e);
        }
    }

    async fn stop(self: &Arc<Self>, manual: bool) -> StopOutcome {
        if manual {
            self.set_manually_stopped(true);
            self.recovery.clear();
        }

        let (handle, run) = {
            let mut lc = self.lifecycle.lock();
            match lc.state {
                ServiceState::Stopping => {
                    debug!("Stop already in progress");
                    return StopOutcome::AlreadyStopping;
                }
                ServiceState::Stopped => {
                    debug!("Stop ignored: already stopped");
                    return StopOutcome::AlreadyStopped;
                }
                ServiceState::Starting | ServiceState::Running => {}
            }
            lc.op_id += 1;
            if let Some(cancel) = lc.start_cancel.take() {
                cancel.cancel();
            }
            self.transition(&mut lc, ServiceState::Stopping, SnapshotPatch::new());
            (lc.handle.take(), lc.run.take())
        };

        info!("Stopping tunnel (manual: {})", manual);
        drop(run);
        if let Some(handle) = handle {
            self.close_engine(handle).await;
        }

        let pending = {
            let mut lc = self.lifecycle.lock();
            lc.started_at = None;
            self.transition(&mut lc, ServiceState::Stopped, SnapshotPatch::new().active_label(""));
            lc.pending_start.take()
        };
        info!("Tunnel stopped");

        if let Some(config_path) = pending {
            info!("Replaying start queued during stop");
            self.begin_start(config_path);
        }
        StopOutcome::Stopped
    }

    async fn restart(self: &Arc<Self>, reason: &str) -> Result<()> {
        let config_path = self
            .lifecycle
            .lock()
            .config_path
            .clone()
            .ok_or_else(|| DaemonError::InvalidRequest("no configuration to restart with".to_string()))?;
        info!("Restarting tunnel (reason: {})", reason);
        self.stop(false).await;
        tokio::time::sleep(self.config.lifecycle.restart_delay).await;
        if self.is_manually_stopped() {
            info!("Restart abandoned: tunnel was stopped manually");
            return Ok(());
        }
        if self.is_closing() {
            info!("Restart abandoned: service shutting down");
            return Ok(());
        }
        self.start_and_wait(config_path).await
    }

    async fn full_restart(self: &Arc<Self>, config_path: PathBuf) -> Result<()> {
        info!("Full restart with {:?}", config_path);
        self.stop(false).await;
        tokio::time::sleep(self.config.lifecycle.restart_delay).await;
        if self.is_closing() {
            return Err(DaemonError::Cancelled);
        }
        self.start_and_wait(config_path).await
    }

    async fn switch_node(self: &Arc<Self>, target: SwitchTarget) -> Result<SwitchNodeResult> {
        if self.state() != ServiceState::Running {
            return Err(DaemonError::NotRunning);
        }

        let tag = match target {
            SwitchTarget::Tag(tag) => tag,
            SwitchTarget::Next => next_outbound(
                &self.engine.list_outbounds(),
                self.engine.selected_outbound().as_deref(),
            )
            .ok_or_else(|| DaemonError::InvalidRequest("engine has no outbounds".to_string()))?,
        };

        let group = &self.config.lifecycle.selector_group;
        let result = self.engine.select_outbound(group, &tag).await;
        match result {
            SwitchResult::Success => {
                info!("Switched {} to {}", group, tag);
                self.hub.update(SnapshotPatch::new().active_label(tag.clone()));
            }
            SwitchResult::NeedRestart => {
                info!("Switch to {} needs a restart", tag);
                let config_path = self.lifecycle.lock().config_path.clone();
                if let Some(config_path) = config_path {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = inner.full_restart(config_path).await {
                            error!("Restart after switch failed: {}", e);
                        }
                    });
                }
            }
            SwitchResult::Failed => warn!("Switch to {} failed", tag),
        }

        Ok(SwitchNodeResult { result, target: Some(tag) })
    }

    async fn hot_reload(&self, config_content: &str) -> HotReloadResult {
        if self.state() != ServiceState::Running {
            return HotReloadResult::NotRunning;
        }
        match self.engine.hot_reload(config_content).await {
            Ok(true) => {
                info!("Configuration hot-reloaded");
                HotReloadResult::Success
            }
            Ok(false) => {
                warn!("Engine rejected reloaded configuration");
                HotReloadResult::KernelError
            }
            Err(EngineError::NotStarted) => HotReloadResult::NotRunning,
            Err(e @ (EngineError::InvalidConfig(_) | EngineError::Failed(_))) => {
                warn!("Hot reload failed: {}", e);
                HotReloadResult::KernelError
            }
            Err(e) => {
                warn!("Hot reload failed: {}", e);
                HotReloadResult::UnknownError
            }
        }
    }

    fn prepare_restart_allowed(&self) -> bool {
        let min_interval = self.config.lifecycle.prepare_restart_min_interval;
        if let Some(store) = &self.store {
            match store.should_trigger_prepare_restart(min_interval) {
                Ok(allowed) => return allowed,
                Err(e) => warn!("Prepare-restart throttle unavailable: {}", e),
            }
        }
        let now = Instant::now();
        let mut last = self.last_prepare_restart.lock();
        if last.is_some_and(|at| now.duration_since(at) < min_interval) {
            return false;
        }
        *last = Some(now);
        true
    }

    async fn prepare_restart(&self, reason: &str) -> bool {
        if self.state() != ServiceState::Running {
            debug!("Prepare-restart ignored: not running");
            return false;
        }
        if !self.prepare_restart_allowed() {
            debug!("Prepare-restart throttled (reason: {})", reason);
            return false;
        }
        info!("Preparing for restart (reason: {})", reason);
        self.engine.wake();
        self.engine.set_underlying_network(None);
        tokio::time::sleep(self.config.lifecycle.prepare_restart_settle).await;
        true
    }

    fn request_if_running(&self, request: RecoveryRequest) -> bool {
        if self.state() != ServiceState::Running {
            debug!("Ignoring {}: not running", request.kind());
            return false;
        }
        self.recovery.request(request);
        true
    }

    fn on_app_lifecycle(&self, foreground: bool) -> bool {
        let now = Instant::now();
        let mut app = self.app.lock();
        if !foreground {
            app.background_since = Some(now);
            return false;
        }

        let background_since = app.background_since.take();
        if self.state() != ServiceState::Running {
            return false;
        }
        let lifecycle = &self.config.lifecycle;
        let long_enough = background_since
            .is_some_and(|at| now.duration_since(at) >= lifecycle.foreground_min_background);
        let debounced = app
            .last_foreground_recovery
            .is_some_and(|at| now.duration_since(at) < lifecycle.foreground_debounce);
        if !long_enough || debounced {
            debug!("Foreground without bump (long_enough: {}, debounced: {})", long_enough, debounced);
            return false;
        }
        app.last_foreground_recovery = Some(now);
        drop(app);

        self.recovery.request(RecoveryRequest::network_bump("app_foreground"));
        true
    }

    fn on_device_idle(&self, idle: bool) -> bool {
        let detector = {
            let lc = self.lifecycle.lock();
            if lc.state != ServiceState::Running {
                return false;
            }
            lc.run.as_ref().map(|run| run.detector.clone())
        };

        if idle {
            if let Some(detector) = &detector {
                detector.pause();
            }
            self.recovery.request(RecoveryRequest::enter_device_idle("device_idle_enter"));
        } else {
            if let Some(detector) = &detector {
                detector.resume();
            }
            self.recovery.request(RecoveryRequest::network_bump("doze_exit"));
        }
        true
    }

    fn status(&self) -> StatusResult {
        let snapshot = self.hub.snapshot();
        let lc = self.lifecycle.lock();
        let (rates, attempts, interface) = match &lc.run {
            Some(run) => (
                run.detector.rates(),
                run.policy.lock().attempts(),
                Some(run.monitor.default_interface_name()).filter(|name| !name.is_empty()),
            ),
            None => (TrafficRates::default(), 0, None),
        };

        StatusResult {
            state: lc.state,
            active_label: snapshot.active_label,
            last_error: snapshot.last_error,
            manually_stopped: snapshot.manually_stopped,
            version: snapshot.version,
            config_path: lc.config_path.clone(),
            uptime_secs: lc.started_at.map(|at| at.elapsed().as_secs()),
            underlying_interface: interface,
            upload_bps: rates.upload_bps,
            download_bps: rates.download_bps,
            stall_refresh_attempts: attempts,
            subscribers: self.hub.subscriber_count(),
        }
    }
}

// ============================================================================
// Recovery hooks
// ============================================================================

/// Narrow capability view handed to the recovery coordinator.
struct ServiceHooks {
    inner: Weak<ServiceInner>,
}

impl ServiceHooks {
    fn inner(&self) -> Option<Arc<ServiceInner>> {
        self.inner.upgrade()
    }
}

#[async_trait]
impl RecoveryHooks for ServiceHooks {
    fn is_running(&self) -> bool {
        self.inner().is_some_and(|i| i.state() == ServiceState::Running)
    }

    fn is_stopping(&self) -> bool {
        self.inner().is_some_and(|i| i.state() == ServiceState::Stopping)
    }

    fn is_manually_stopped(&self) -> bool {
        self.inner().is_some_and(|i| i.is_manually_stopped())
    }

    fn wake(&self) -> bool {
        self.inner().is_some_and(|i| i.engine.wake())
    }

    fn pause(&self) -> bool {
        self.inner().is_some_and(|i| i.engine.pause())
    }

    fn is_paused(&self) -> bool {
        self.inner().is_some_and(|i| i.engine.is_paused())
    }

    fn was_paused_recently(&self, window: Duration) -> bool {
        self.inner().is_some_and(|i| i.engine.was_paused_recently(window))
    }

    async fn recover_network(&self, mode: RecoveryMode) -> bool {
        match self.inner() {
            Some(i) => i.engine.recover_network(mode).await,
            None => false,
        }
    }

    async fn reset_all_connections(&self) -> std::result::Result<(), EngineError> {
        match self.inner() {
            Some(i) => i.engine.reset_all_connections(true).await,
            None => Err(EngineError::NotStarted),
        }
    }

    async fn reset_network(&self) -> std::result::Result<(), EngineError> {
        match self.inner() {
            Some(i) => i.engine.reset_network().await,
            None => Err(EngineError::NotStarted),
        }
    }

    async fn close_idle_connections(&self, max_idle: Duration) -> usize {
        match self.inner() {
            Some(i) => i.engine.close_idle_connections(max_idle).await,
            None => 0,
        }
    }

    async fn close_all_tracked_connections(&self) -> usize {
        match self.inner() {
            Some(i) => i.engine.close_all_tracked_connections().await,
            None => 0,
        }
    }

    async fn probe(&self, url: &str, timeout: Duration) -> Option<u32> {
        let i = self.inner()?;
        i.engine
            .url_test_outbound(&i.config.recovery.probe_outbound, url, timeout)
            .await
    }

    fn reassert_network(&self) -> bool {
        self.inner()
            .and_then(|i| i.run_monitor())
            .is_some_and(|monitor| monitor.reassert())
    }

    async fn restart(&self, reason: &str) -> Result<()> {
        let inner = self.inner().ok_or(DaemonError::NotRunning)?;
        inner.restart(reason).await
    }
}

// ============================================================================
// IPC dispatch
// ============================================================================

fn parse_params<T: DeserializeOwned>(
    params: Option<serde_json::Value>,
) -> std::result::Result<T, String> {
    params
        .ok_or_else(|| "Missing params".to_string())
        .and_then(|p| serde_json::from_value(p).map_err(|e| format!("Invalid params: {}", e)))
}

fn parse_optional<T: DeserializeOwned + Default>(
    params: Option<serde_json::Value>,
) -> std::result::Result<T, String> {
    match params {
        None | Some(serde_json::Value::Null) => Ok(T::default()),
        Some(p) => serde_json::from_value(p).map_err(|e| format!("Invalid params: {}", e)),
    }
}

fn to_value<T: Serialize>(value: T) -> std::result::Result<serde_json::Value, String> {
    serde_json::to_value(value).map_err(|e| format!("Serialize error: {}", e))
}

fn accepted(accepted: bool) -> std::result::Result<serde_json::Value, String> {
    to_value(AcceptedResult { accepted })
}

impl IpcHandler for DaemonService {
    fn handle(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<serde_json::Value, String>> + Send + '_>>
    {
        let method = method.to_string();
        Box::pin(async move {
            debug!("Handling method: {}", method);

            match method.as_str() {
                methods::START => {
                    let params: StartParams = parse_params(params)?;
                    to_value(StartResult { outcome: self.start(params.config_path) })
                }

                methods::STOP => {
                    let params: StopParams = parse_optional(params)?;
                    to_value(StopResult { outcome: self.stop(params.manual).await })
                }

                methods::SWITCH_NODE => {
                    let params: SwitchNodeParams = parse_optional(params)?;
                    let target = params.target.map_or(SwitchTarget::Next, SwitchTarget::Tag);
                    let result = self
                        .switch_node(target)
                        .await
                        .map_err(|e| format!("Switch error: {}", e))?;
                    to_value(result)
                }

                methods::RESET_CONNECTIONS => {
                    let params: ReasonParams = parse_optional(params)?;
                    let reason = params.reason.unwrap_or_else(|| "ipc_reset_connections".to_string());
                    accepted(self.reset_connections(&reason))
                }

                methods::NETWORK_BUMP => {
                    let params: ReasonParams = parse_optional(params)?;
                    let reason = params.reason.unwrap_or_else(|| "ipc_network_bump".to_string());
                    accepted(self.network_bump(&reason))
                }

                methods::PREPARE_RESTART => {
                    let params: ReasonParams = parse_optional(params)?;
                    let reason = params.reason.unwrap_or_else(|| "ipc_prepare_restart".to_string());
                    accepted(self.prepare_restart(&reason).await)
                }

                methods::HOT_RELOAD => {
                    let params: HotReloadParams = parse_params(params)?;
                    let result = self.hot_reload(&params.config_content).await;
                    to_value(HotReloadReply { result, code: result.code() })
                }

                methods::FULL_RESTART => {
                    let params: StartParams = parse_params(params)?;
                    self.full_restart(params.config_path)
                        .await
                        .map_err(|e| format!("Restart error: {}", e))?;
                    Ok(serde_json::json!({"success": true}))
                }

                methods::RECOVER => {
                    let params: RecoverParams = parse_params(params)?;
                    let reason = params
                        .reason
                        .unwrap_or_else(|| format!("ipc_recover_{}", params.mode));
                    accepted(self.recover(params.mode, &reason))
                }

                methods::APP_LIFECYCLE => {
                    let params: AppLifecycleParams = parse_params(params)?;
                    accepted(self.on_app_lifecycle(params.foreground))
                }

                methods::DEVICE_IDLE => {
                    let params: DeviceIdleParams = parse_params(params)?;
                    accepted(self.on_device_idle(params.idle))
                }

                methods::STATUS => to_value(self.status()),

                _ => Err(format!("Unknown method: {}", method)),
            }
        })
    }
}
