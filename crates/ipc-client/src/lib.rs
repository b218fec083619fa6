//! tunnelkeeper IPC Client
//!
//! JSON-RPC 2.0 client for the tunnelkeeper daemon, plus [`StateWatcher`],
//! a reconnecting observer of the daemon's state broadcasts.
//!
//! ## Usage
//!
//! ```ignore
//! use tunnelkeeper_ipc_client::{default_socket_path, IpcClient};
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = IpcClient::connect(&default_socket_path()).await?;
//!
//!     let outcome = client.start(PathBuf::from("/etc/tunnelkeeper/tunnel.json")).await?;
//!     println!("Start: {:?}", outcome);
//!
//!     let status = client.status().await?;
//!     println!("Status: {:?}", status);
//!
//!     Ok(())
//! }
//! ```

mod client;
mod presence;
mod watch;

pub use client::IpcClient;
pub use presence::{SysfsTunnelPresence, TunnelPresence};
pub use tunnelkeeper_core::protocol::{
    HotReloadReply, RpcError, RpcRequest, RpcResponse, StartOutcome, StatusResult, StopOutcome,
    SwitchNodeResult,
};
pub use watch::{reconnect_delay, StateWatcher, WatchConfig};

use std::path::PathBuf;

use thiserror::Error;

/// Socket path used when `$XDG_RUNTIME_DIR` is unavailable
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tunnelkeeper.sock";

/// Where the daemon listens by default: `$XDG_RUNTIME_DIR/tunnelkeeper.sock`
/// on Linux, [`DEFAULT_SOCKET_PATH`] elsewhere.
pub fn default_socket_path() -> PathBuf {
    if cfg!(target_os = "linux") {
        if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
            return PathBuf::from(runtime_dir).join("tunnelkeeper.sock");
        }
    }
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Daemon error: {message} (code: {code})")]
    DaemonError { code: i32, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Daemon not running")]
    DaemonNotRunning,
}

pub type Result<T> = std::result::Result<T, IpcError>;
