//! tunnelkeeper core
//!
//! Data model, tunnel engine capability trait and the JSON-RPC wire
//! protocol shared by the daemon, the IPC client and the CLI.

pub mod engine;
pub mod protocol;
pub mod stub;
pub mod types;

pub use engine::{EngineError, EngineHandle, TunnelEngine, TunnelFd, TunnelOptions};
pub use stub::{EngineCalls, StubEngine};
pub use types::*;
