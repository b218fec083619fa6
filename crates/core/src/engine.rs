//! Tunnel engine capability trait.
//!
//! The packet engine is an external collaborator. The lifecycle service is
//! the only component that holds an `Arc<dyn TunnelEngine>`; everything
//! else reaches it through narrow capability traits defined by the daemon.

use std::time::Duration;

use async_trait::async_trait;

use crate::types::{NetworkSnapshot, RecoveryMode, SwitchResult, TrafficTotals};

/// Opaque handle of a started engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(pub u64);

/// Platform tunnel file descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelFd(pub i32);

/// Parameters for opening the platform tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOptions {
    pub mtu: u32,
    pub addresses: Vec<String>,
    pub auto_route: bool,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            mtu: 1500,
            addresses: vec!["172.19.0.1/30".to_string()],
            auto_route: true,
        }
    }
}

/// Errors reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Engine failure: {0}")]
    Failed(String),

    #[error("Engine not started")]
    NotStarted,
}

/// Capability set consumed from the tunnel engine.
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Start an engine instance from a configuration blob.
    async fn start(&self, config: &str) -> Result<EngineHandle, EngineError>;

    async fn close(&self, handle: EngineHandle) -> Result<(), EngineError>;

    async fn open_tunnel_descriptor(&self, options: &TunnelOptions)
        -> Result<TunnelFd, EngineError>;

    fn wake(&self) -> bool;

    fn pause(&self) -> bool;

    fn is_paused(&self) -> bool;

    /// Whether the engine was paused at any point within `window`.
    fn was_paused_recently(&self, window: Duration) -> bool;

    /// Close connections idle for longer than `max_idle`, returning how many closed.
    async fn close_idle_connections(&self, max_idle: Duration) -> usize;

    async fn close_all_tracked_connections(&self) -> usize;

    async fn recover_network(&self, mode: RecoveryMode) -> bool;

    async fn reset_all_connections(&self, force: bool) -> Result<(), EngineError>;

    async fn reset_network(&self) -> Result<(), EngineError>;

    /// Latency test through `selected_tag`. `None` means the probe failed.
    async fn url_test_outbound(&self, selected_tag: &str, url: &str, timeout: Duration)
        -> Option<u32>;

    async fn select_outbound(&self, group_tag: &str, target_tag: &str) -> SwitchResult;

    /// Apply new configuration content without restarting. `Ok(false)` means
    /// the engine rejected it.
    async fn hot_reload(&self, config: &str) -> Result<bool, EngineError>;

    fn set_underlying_network(&self, network: Option<&NetworkSnapshot>);

    fn traffic_totals(&self) -> TrafficTotals;

    fn selected_outbound(&self) -> Option<String>;

    fn list_outbounds(&self) -> Vec<String>;
}
