//! JSON-RPC 2.0 protocol types shared by the daemon and its clients.
//!
//! Framing is one JSON object per line. Requests and responses carry an
//! `id`; pushed state changes are [`EventMessage`]s without one.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{HotReloadResult, RecoveryMode, ServiceState, StateSnapshot, SwitchResult};

pub const JSONRPC_VERSION: &str = "2.0";

/// Method names understood by the daemon
pub mod methods {
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const SWITCH_NODE: &str = "switch_node";
    pub const RESET_CONNECTIONS: &str = "reset_connections";
    pub const NETWORK_BUMP: &str = "network_bump";
    pub const PREPARE_RESTART: &str = "prepare_restart";
    pub const HOT_RELOAD: &str = "hot_reload";
    pub const FULL_RESTART: &str = "full_restart";
    pub const RECOVER: &str = "recover";
    pub const APP_LIFECYCLE: &str = "app_lifecycle";
    pub const DEVICE_IDLE: &str = "device_idle";
    pub const STATUS: &str = "status";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
}

/// Event name used for hub pushes
pub const STATE_CHANGED_EVENT: &str = "state_changed";

/// Standard JSON-RPC error codes
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const SERVER_ERROR: i32 = -32000;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub id: serde_json::Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: serde_json::Value::from(id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: serde_json::Value,
}

impl RpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: serde_json::Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcError { code, message, data: None }),
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Server-initiated push
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: String,
    pub data: serde_json::Value,
}

/// A line read from a daemon connection: either a response or a push.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(EventMessage),
    Response(RpcResponse),
}

/// Push payload; `state` is the ordinal of [`ServiceState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    pub state: u8,
    pub active_label: String,
    pub last_error: String,
    pub manually_stopped: bool,
    #[serde(default)]
    pub version: u64,
}

impl From<&StateSnapshot> for StatePayload {
    fn from(snapshot: &StateSnapshot) -> Self {
        Self {
            state: snapshot.state.ordinal(),
            active_label: snapshot.active_label.clone(),
            last_error: snapshot.last_error.clone(),
            manually_stopped: snapshot.manually_stopped,
            version: snapshot.version,
        }
    }
}

impl StatePayload {
    /// Unknown ordinals decode as STOPPED.
    pub fn into_snapshot(self) -> StateSnapshot {
        StateSnapshot {
            state: ServiceState::from_ordinal(self.state).unwrap_or_default(),
            active_label: self.active_label,
            last_error: self.last_error,
            manually_stopped: self.manually_stopped,
            version: self.version,
        }
    }
}

// ============================================================================
// Method parameters
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartParams {
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopParams {
    #[serde(default = "default_manual")]
    pub manual: bool,
}

fn default_manual() -> bool {
    true
}

impl Default for StopParams {
    fn default() -> Self {
        Self { manual: default_manual() }
    }
}

/// `target` absent means "next outbound in order".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchNodeParams {
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasonParams {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotReloadParams {
    pub config_content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverParams {
    pub mode: RecoveryMode,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppLifecycleParams {
    pub foreground: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdleParams {
    pub idle: bool,
}

// ============================================================================
// Method results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyActive,
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    AlreadyStopping,
    AlreadyStopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResult {
    pub outcome: StartOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResult {
    pub outcome: StopOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchNodeResult {
    pub result: SwitchResult,
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotReloadReply {
    pub result: HotReloadResult,
    pub code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedResult {
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeResult {
    pub subscribed: bool,
    pub subscriber_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub state: ServiceState,
    pub active_label: String,
    pub last_error: String,
    pub manually_stopped: bool,
    pub version: u64,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    #[serde(default)]
    pub uptime_secs: Option<u64>,
    #[serde(default)]
    pub underlying_interface: Option<String>,
    #[serde(default)]
    pub upload_bps: u64,
    #[serde(default)]
    pub download_bps: u64,
    #[serde(default)]
    pub stall_refresh_attempts: u32,
    #[serde(default)]
    pub subscribers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_request_serialization() {
        let request = RpcRequest::new(
            methods::START,
            Some(serde_json::json!({"config_path": "/etc/tk/a.json"})),
            1,
        );
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"start\""));
    }

    #[test]
    fn test_rpc_request_no_params() {
        let request = RpcRequest::new(methods::STATUS, None, 1);
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_server_message_distinguishes_events() {
        let event = r#"{"event":"state_changed","data":{"state":2,"active_label":"a","last_error":"","manually_stopped":false}}"#;
        match serde_json::from_str::<ServerMessage>(event).unwrap() {
            ServerMessage::Event(e) => assert_eq!(e.event, STATE_CHANGED_EVENT),
            other => panic!("expected event, got {:?}", other),
        }

        let response = r#"{"jsonrpc":"2.0","result":{"subscribed":true,"subscriber_id":3},"id":1}"#;
        assert!(matches!(
            serde_json::from_str::<ServerMessage>(response).unwrap(),
            ServerMessage::Response(_)
        ));
    }

    #[test]
    fn test_state_payload_uses_ordinal() {
        let snapshot = StateSnapshot {
            state: ServiceState::Running,
            active_label: "jp-2".into(),
            last_error: String::new(),
            manually_stopped: false,
            version: 7,
        };
        let value = serde_json::to_value(StatePayload::from(&snapshot)).unwrap();
        assert_eq!(value["state"], 2);
        assert_eq!(value["active_label"], "jp-2");

        let back: StatePayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.into_snapshot(), snapshot);
    }

    #[test]
    fn test_stop_params_default_manual() {
        let params: StopParams = serde_json::from_str("{}").unwrap();
        assert!(params.manual);
    }

    #[test]
    fn test_rpc_response_with_error() {
        let json = r#"{"jsonrpc":"2.0","error":{"code":-32600,"message":"Invalid request"},"id":1}"#;
        let response: RpcResponse = serde_json::from_str(json).unwrap();
        assert!(response.result.is_none());
        assert_eq!(response.error.as_ref().unwrap().code, -32600);
    }
}
