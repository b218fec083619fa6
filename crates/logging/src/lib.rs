//! tunnelkeeper logging
//!
//! Shared tracing setup for the daemon and the CLI. `RUST_LOG` always wins
//! over the configured level.
//!
//! ## Usage
//!
//! ```no_run
//! use tunnelkeeper_logging::{init, init_with_config, LogConfig, LogLevel};
//!
//! // Each `-v` on the command line raises the level by one step
//! init(LogLevel::Warn.louder(1));
//!
//! // Or with explicit formatting options
//! init_with_config(&LogConfig { level: LogLevel::Debug, show_target: true, ansi: false });
//! ```

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Log level, ordered from quietest to loudest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [Self::Error, Self::Warn, Self::Info, Self::Debug, Self::Trace];

    /// `steps` levels louder than `self`, saturating at `Trace`.
    pub fn louder(self, steps: u8) -> Self {
        let index = (self as usize).saturating_add(steps as usize);
        Self::ALL[index.min(Self::ALL.len() - 1)]
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Subscriber options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Print the module path of each event
    pub show_target: bool,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            show_target: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn with_level(level: LogLevel) -> Self {
        Self { level, ..Self::default() }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::default().add_directive(LevelFilter::from(self.level).into())
        })
    }
}

/// Initialize logging with the specified level
///
/// This sets up tracing-subscriber with a formatted output.
/// Call this once at the start of your application.
///
/// # Panics
///
/// Panics if called more than once (tracing subscriber already set).
/// Use `try_init` if you need to handle this case.
pub fn init(level: LogLevel) {
    try_init(level).expect("Failed to initialize logging");
}

/// Try to initialize logging, returning an error if already initialized
pub fn try_init(level: LogLevel) -> Result<(), String> {
    try_init_with_config(&LogConfig::with_level(level))
}

/// Initialize logging with custom formatting
///
/// # Panics
///
/// Panics if a global subscriber is already set.
pub fn init_with_config(config: &LogConfig) {
    try_init_with_config(config).expect("Failed to initialize logging");
}

pub fn try_init_with_config(config: &LogConfig) -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_target(config.show_target)
        .with_ansi(config.ansi)
        .try_init()
        .map_err(|e| e.to_string())
}

/// Initialize logging for tests (captures output for test framework).
/// Safe to call from every test.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::default().add_directive(LevelFilter::DEBUG.into()))
        .with_test_writer()
        .try_init();
}
