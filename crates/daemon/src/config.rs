//! Coordinator configuration
//!
//! Every tuning constant lives here with its default. Durations are
//! written as integer milliseconds in the JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ipc::IpcConfig;
use crate::{DaemonError, Result};

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Pause between the stop and start halves of a restart
    #[serde(with = "duration_ms")]
    pub restart_delay: Duration,
    /// Settle time after withdrawing the underlying network in prepare-restart
    #[serde(with = "duration_ms")]
    pub prepare_restart_settle: Duration,
    /// Cross-process throttle for prepare-restart
    #[serde(with = "duration_ms")]
    pub prepare_restart_min_interval: Duration,
    /// Minimum time in background before a foreground return triggers recovery
    #[serde(with = "duration_ms")]
    pub foreground_min_background: Duration,
    /// Minimum spacing between foreground recoveries
    #[serde(with = "duration_ms")]
    pub foreground_debounce: Duration,
    /// Selector group used for outbound switching
    pub selector_group: String,
    pub tunnel_mtu: u32,
    pub tunnel_addresses: Vec<String>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_millis(500),
            prepare_restart_settle: Duration::from_millis(100),
            prepare_restart_min_interval: Duration::from_millis(1000),
            foreground_min_background: Duration::from_secs(2),
            foreground_debounce: Duration::from_secs(2),
            selector_group: "proxy".to_string(),
            tunnel_mtu: 1500,
            tunnel_addresses: vec!["172.19.0.1/30".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    #[serde(with = "duration_ms")]
    pub reset_connections_debounce: Duration,
    #[serde(with = "duration_ms")]
    pub reset_core_network_debounce: Duration,
    #[serde(with = "duration_ms")]
    pub force_reset_min_interval: Duration,
    /// Grace period between resetting connections and the network stack
    #[serde(with = "duration_ms")]
    pub force_reset_grace: Duration,
    pub reset_failure_threshold: u32,
    #[serde(with = "duration_ms")]
    pub reset_failure_window: Duration,
    #[serde(with = "duration_ms")]
    pub restart_cooldown: Duration,
    #[serde(with = "duration_ms")]
    pub deep_recovery_cooldown: Duration,
    #[serde(with = "duration_ms")]
    pub network_bump_cooldown: Duration,
    pub probe_url: String,
    /// Outbound probed when the engine reports no selection
    pub probe_outbound: String,
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub verify_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub wake_settle: Duration,
    #[serde(with = "duration_ms")]
    pub soft_idle_threshold: Duration,
    #[serde(with = "duration_ms")]
    pub soft_settle: Duration,
    #[serde(with = "duration_ms")]
    pub medium_settle: Duration,
    #[serde(with = "duration_ms")]
    pub hard_settle: Duration,
    /// Window used to decide whether the engine was "recently paused"
    #[serde(with = "duration_ms")]
    pub recently_paused_window: Duration,
    pub verify_after_recover: bool,
    #[serde(with = "duration_ms")]
    pub verify_delay: Duration,
    /// Delay before a failed bump escalates to `Recover(FULL)`
    #[serde(with = "duration_ms")]
    pub bump_escalation_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            reset_connections_debounce: Duration::from_millis(2000),
            reset_core_network_debounce: Duration::from_millis(2500),
            force_reset_min_interval: Duration::from_millis(100),
            force_reset_grace: Duration::from_millis(150),
            reset_failure_threshold: 3,
            reset_failure_window: Duration::from_secs(30),
            restart_cooldown: Duration::from_secs(120),
            deep_recovery_cooldown: Duration::from_secs(10),
            network_bump_cooldown: Duration::from_secs(2),
            probe_url: "https://www.gstatic.com/generate_204".to_string(),
            probe_outbound: "proxy".to_string(),
            probe_timeout: Duration::from_secs(3),
            verify_timeout: Duration::from_secs(5),
            wake_settle: Duration::from_millis(50),
            soft_idle_threshold: Duration::from_secs(30),
            soft_settle: Duration::from_millis(100),
            medium_settle: Duration::from_millis(100),
            hard_settle: Duration::from_millis(200),
            recently_paused_window: Duration::from_secs(30),
            verify_after_recover: true,
            verify_delay: Duration::from_millis(500),
            bump_escalation_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(with = "duration_ms")]
    pub startup_grace: Duration,
    #[serde(with = "duration_ms")]
    pub debounce: Duration,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Root of the sysfs network class directory
    pub sysfs_root: PathBuf,
    /// Kernel routing table used to detect default routes
    pub route_table: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(3),
            debounce: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            sysfs_root: PathBuf::from("/sys/class/net"),
            route_table: PathBuf::from("/proc/net/route"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StallConfig {
    #[serde(with = "duration_ms")]
    pub sample_interval: Duration,
    #[serde(with = "duration_ms")]
    pub check_interval: Duration,
    pub min_bytes_delta: u64,
    pub min_stall_checkpoints: u32,
    pub max_refresh_attempts: u32,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            check_interval: Duration::from_secs(15),
            min_bytes_delta: 1024,
            min_stall_checkpoints: 3,
            max_refresh_attempts: 3,
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub lifecycle: LifecycleConfig,
    pub recovery: RecoveryConfig,
    pub network: NetworkConfig,
    pub stall: StallConfig,
    pub ipc: IpcConfig,
    /// Directory of the durable state store; platform default when unset
    pub state_dir: Option<PathBuf>,
}

impl CoordinatorConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| DaemonError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("network.poll_interval", self.network.poll_interval),
            ("stall.sample_interval", self.stall.sample_interval),
            ("stall.check_interval", self.stall.check_interval),
            ("recovery.probe_timeout", self.recovery.probe_timeout),
            ("recovery.verify_timeout", self.recovery.verify_timeout),
        ];
        for (name, value) in nonzero {
            if value.is_zero() {
                return Err(DaemonError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.stall.min_stall_checkpoints == 0 {
            return Err(DaemonError::Config(
                "stall.min_stall_checkpoints must be at least 1".to_string(),
            ));
        }
        if self.stall.check_interval < self.stall.sample_interval {
            return Err(DaemonError::Config(
                "stall.check_interval must not be shorter than stall.sample_interval".to_string(),
            ));
        }
        Ok(())
    }
}
