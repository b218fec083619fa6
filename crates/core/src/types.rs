use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the tunnel service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServiceState {
    /// Integer form used in push payloads
    pub fn ordinal(self) -> u8 {
        match self {
            ServiceState::Stopped => 0,
            ServiceState::Starting => 1,
            ServiceState::Running => 2,
            ServiceState::Stopping => 3,
        }
    }

    pub fn from_ordinal(value: u8) -> Option<Self> {
        match value {
            0 => Some(ServiceState::Stopped),
            1 => Some(ServiceState::Starting),
            2 => Some(ServiceState::Running),
            3 => Some(ServiceState::Stopping),
            _ => None,
        }
    }

    /// STARTING or RUNNING
    pub fn is_active(self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable view of the service state published to observers.
///
/// `version` increases by one for every applied patch, which lets the hub
/// and remote observers discard anything older than what they already hold.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: ServiceState,
    pub active_label: String,
    pub last_error: String,
    pub manually_stopped: bool,
    pub version: u64,
}

impl StateSnapshot {
    /// Returns a new snapshot with the patch applied and the version bumped.
    pub fn apply(&self, patch: &SnapshotPatch) -> StateSnapshot {
        StateSnapshot {
            state: patch.state.unwrap_or(self.state),
            active_label: patch
                .active_label
                .clone()
                .unwrap_or_else(|| self.active_label.clone()),
            last_error: patch
                .last_error
                .clone()
                .unwrap_or_else(|| self.last_error.clone()),
            manually_stopped: patch.manually_stopped.unwrap_or(self.manually_stopped),
            version: self.version + 1,
        }
    }
}

/// Partial update merged into the current snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotPatch {
    pub state: Option<ServiceState>,
    pub active_label: Option<String>,
    pub last_error: Option<String>,
    pub manually_stopped: Option<bool>,
}

impl SnapshotPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: ServiceState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn active_label(mut self, label: impl Into<String>) -> Self {
        self.active_label = Some(label.into());
        self
    }

    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn manually_stopped(mut self, value: bool) -> Self {
        self.manually_stopped = Some(value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.active_label.is_none()
            && self.last_error.is_none()
            && self.manually_stopped.is_none()
    }
}

/// Which data path is currently owned by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreMode {
    #[default]
    None,
    Tunnel,
    ProxyOnly,
}

/// Outcome of a hot outbound switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchResult {
    Success,
    NeedRestart,
    Failed,
}

/// Target of a SWITCH_NODE command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchTarget {
    Tag(String),
    Next,
}

/// Result codes of a hot configuration reload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotReloadResult {
    Success,
    NotRunning,
    KernelError,
    UnknownError,
}

impl HotReloadResult {
    pub fn code(self) -> i32 {
        match self {
            HotReloadResult::Success => 0,
            HotReloadResult::NotRunning => 1,
            HotReloadResult::KernelError => 2,
            HotReloadResult::UnknownError => 3,
        }
    }
}

/// Network recovery primitive strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    Quick,
    Full,
    Deep,
    Proactive,
    Auto,
}

impl RecoveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryMode::Quick => "quick",
            RecoveryMode::Full => "full",
            RecoveryMode::Deep => "deep",
            RecoveryMode::Proactive => "proactive",
            RecoveryMode::Auto => "auto",
        }
    }

    /// Next stronger mode after a failed verification, `None` once deep failed.
    pub fn escalate(self) -> Option<RecoveryMode> {
        match self {
            RecoveryMode::Quick | RecoveryMode::Auto | RecoveryMode::Proactive => {
                Some(RecoveryMode::Full)
            }
            RecoveryMode::Full => Some(RecoveryMode::Deep),
            RecoveryMode::Deep => None,
        }
    }
}

impl fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quick" => Ok(RecoveryMode::Quick),
            "full" => Ok(RecoveryMode::Full),
            "deep" => Ok(RecoveryMode::Deep),
            "proactive" => Ok(RecoveryMode::Proactive),
            "auto" => Ok(RecoveryMode::Auto),
            other => Err(format!("unknown recovery mode: {}", other)),
        }
    }
}

/// Work item accepted by the recovery coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryRequest {
    Restart {
        reason: String,
    },
    ResetConnections {
        reason: String,
        skip_debounce: bool,
    },
    ResetCoreNetwork {
        reason: String,
        force: bool,
    },
    NetworkBump {
        reason: String,
    },
    Recover {
        mode: RecoveryMode,
        reason: String,
    },
    EnterDeviceIdle {
        reason: String,
    },
    CloseIdleConnections {
        max_idle: Duration,
        reason: String,
    },
    VerifyConnectivity {
        reason: String,
        escalate_from: Option<RecoveryMode>,
    },
}

impl RecoveryRequest {
    pub fn restart(reason: impl Into<String>) -> Self {
        RecoveryRequest::Restart { reason: reason.into() }
    }

    pub fn reset_connections(reason: impl Into<String>, skip_debounce: bool) -> Self {
        RecoveryRequest::ResetConnections { reason: reason.into(), skip_debounce }
    }

    pub fn reset_core_network(reason: impl Into<String>, force: bool) -> Self {
        RecoveryRequest::ResetCoreNetwork { reason: reason.into(), force }
    }

    pub fn network_bump(reason: impl Into<String>) -> Self {
        RecoveryRequest::NetworkBump { reason: reason.into() }
    }

    pub fn recover(mode: RecoveryMode, reason: impl Into<String>) -> Self {
        RecoveryRequest::Recover { mode, reason: reason.into() }
    }

    pub fn enter_device_idle(reason: impl Into<String>) -> Self {
        RecoveryRequest::EnterDeviceIdle { reason: reason.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RecoveryRequest::Restart { .. } => "restart",
            RecoveryRequest::ResetConnections { .. } => "reset_connections",
            RecoveryRequest::ResetCoreNetwork { .. } => "reset_core_network",
            RecoveryRequest::NetworkBump { .. } => "network_bump",
            RecoveryRequest::Recover { .. } => "recover",
            RecoveryRequest::EnterDeviceIdle { .. } => "enter_device_idle",
            RecoveryRequest::CloseIdleConnections { .. } => "close_idle_connections",
            RecoveryRequest::VerifyConnectivity { .. } => "verify_connectivity",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            RecoveryRequest::Restart { reason }
            | RecoveryRequest::ResetConnections { reason, .. }
            | RecoveryRequest::ResetCoreNetwork { reason, .. }
            | RecoveryRequest::NetworkBump { reason }
            | RecoveryRequest::Recover { reason, .. }
            | RecoveryRequest::EnterDeviceIdle { reason }
            | RecoveryRequest::CloseIdleConnections { reason, .. }
            | RecoveryRequest::VerifyConnectivity { reason, .. } => reason,
        }
    }

    fn reason_mut(&mut self) -> &mut String {
        match self {
            RecoveryRequest::Restart { reason }
            | RecoveryRequest::ResetConnections { reason, .. }
            | RecoveryRequest::ResetCoreNetwork { reason, .. }
            | RecoveryRequest::NetworkBump { reason }
            | RecoveryRequest::Recover { reason, .. }
            | RecoveryRequest::EnterDeviceIdle { reason }
            | RecoveryRequest::CloseIdleConnections { reason, .. }
            | RecoveryRequest::VerifyConnectivity { reason, .. } => reason,
        }
    }

    /// True when both requests would perform the same action, ignoring reasons.
    pub fn same_action(&self, other: &RecoveryRequest) -> bool {
        use RecoveryRequest::*;
        match (self, other) {
            (Restart { .. }, Restart { .. }) => true,
            (NetworkBump { .. }, NetworkBump { .. }) => true,
            (EnterDeviceIdle { .. }, EnterDeviceIdle { .. }) => true,
            (
                ResetConnections { skip_debounce: a, .. },
                ResetConnections { skip_debounce: b, .. },
            ) => a == b,
            (ResetCoreNetwork { force: a, .. }, ResetCoreNetwork { force: b, .. }) => a == b,
            (Recover { mode: a, .. }, Recover { mode: b, .. }) => a == b,
            (
                CloseIdleConnections { max_idle: a, .. },
                CloseIdleConnections { max_idle: b, .. },
            ) => a == b,
            (
                VerifyConnectivity { escalate_from: a, .. },
                VerifyConnectivity { escalate_from: b, .. },
            ) => a == b,
            _ => false,
        }
    }

    /// Folds another request's reason into this one.
    pub fn merge_reason(&mut self, other: &str) {
        let merged = merge_reasons(self.reason(), other);
        *self.reason_mut() = merged;
    }
}

/// Upper bound for a merged reason string
pub const MAX_REASON_LEN: usize = 240;

/// Joins two reasons with ` | `, skipping duplicates and truncating on a char boundary.
pub fn merge_reasons(existing: &str, incoming: &str) -> String {
    let existing = existing.trim();
    let incoming = incoming.trim();
    let merged = if existing.is_empty() {
        incoming.to_string()
    } else if incoming.is_empty() || existing.split(" | ").any(|r| r == incoming) {
        existing.to_string()
    } else {
        format!("{} | {}", existing, incoming)
    };

    if merged.len() <= MAX_REASON_LEN {
        return merged;
    }
    let mut end = MAX_REASON_LEN;
    while !merged.is_char_boundary(end) {
        end -= 1;
    }
    merged[..end].to_string()
}

/// OS-level identity of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkHandle(pub u64);

impl fmt::Display for NetworkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net#{}", self.0)
    }
}

/// Link transport of a candidate network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Ethernet,
    Wifi,
    Cellular,
    Vpn,
    Other,
}

/// A network as reported by the platform, before selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCandidate {
    pub handle: NetworkHandle,
    pub interface_name: String,
    pub transport: Transport,
    pub has_internet: bool,
    pub validated: bool,
    pub is_expensive: bool,
    pub is_constrained: bool,
}

/// The selected physical uplink handed to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub handle: NetworkHandle,
    pub interface_name: String,
    pub is_expensive: bool,
    pub is_constrained: bool,
}

impl From<&NetworkCandidate> for NetworkSnapshot {
    fn from(candidate: &NetworkCandidate) -> Self {
        Self {
            handle: candidate.handle,
            interface_name: candidate.interface_name.clone(),
            is_expensive: candidate.is_expensive,
            is_constrained: candidate.is_constrained,
        }
    }
}

/// Cumulative byte counters reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrafficTotals {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

impl TrafficTotals {
    pub fn total(&self) -> u64 {
        self.tx_bytes.saturating_add(self.rx_bytes)
    }
}
