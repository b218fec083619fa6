//! tunnelkeeper daemon
//!
//! Keeps a tunnel engine alive and publishes its state to other processes.
//!
//! ## Components
//!
//! - **DaemonService**: lifecycle state machine (STOPPED → STARTING → RUNNING → STOPPING)
//!   and the control command surface
//! - **RecoveryCoordinator**: single-worker queue of repair actions
//! - **NetworkMonitor**: picks the physical uplink and propagates it without flapping
//! - **TrafficStallDetector**: infers stalls from cumulative byte counters
//! - **StateHub**: drain-loop broadcast of state snapshots to subscribers
//! - **IpcServer**: JSON-RPC 2.0 over a Unix socket, with `subscribe` pushes

mod config;
mod hub;
mod ipc;
mod network;
mod recovery;
mod service;
mod stall;
mod sysfs;

pub use config::{
    CoordinatorConfig, LifecycleConfig, NetworkConfig, RecoveryConfig, StallConfig,
};
pub use hub::{ChannelSubscriber, StateHub, StateSubscriber, SubscriberError, SubscriberId};
pub use ipc::{IpcConfig, IpcHandler, IpcServer};
pub use network::{
    score_network, NetworkMonitor, NetworkProvider, StaticNetworkProvider, UnderlyingNetworkSink,
    UpdateOutcome,
};
pub use recovery::{BumpOutcome, RecoveryCoordinator, RecoveryHooks, RecoveryRequester};
pub use service::{DaemonService, StallAction, StallPolicy};
pub use stall::{StallEvent, StallTracker, TrafficRates, TrafficSample, TrafficSource, TrafficStallDetector};
pub use sysfs::SysfsNetworkProvider;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Start failed: {0}")]
    StartFailure(String),

    #[error("Not running")]
    NotRunning,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine error: {0}")]
    Engine(#[from] tunnelkeeper_core::EngineError),

    #[error("State store error: {0}")]
    Store(#[from] tunnelkeeper_store::StoreError),

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
