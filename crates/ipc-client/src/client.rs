//! IPC Client implementation

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use tunnelkeeper_core::protocol::{
    methods, AcceptedResult, AppLifecycleParams, DeviceIdleParams, HotReloadParams,
    HotReloadReply, ReasonParams, RecoverParams, RpcRequest, RpcResponse, StartOutcome,
    StartParams, StartResult, StatusResult, StopOutcome, StopParams, StopResult,
    SwitchNodeParams, SwitchNodeResult,
};
use tunnelkeeper_core::RecoveryMode;

use crate::{IpcError, Result};

/// Open a connection to the daemon socket.
pub(crate) async fn connect_socket(socket_path: &Path) -> Result<UnixStream> {
    UnixStream::connect(socket_path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound
            || e.kind() == std::io::ErrorKind::ConnectionRefused
        {
            IpcError::DaemonNotRunning
        } else {
            IpcError::ConnectionFailed(e.to_string())
        }
    })
}

/// IPC Client for sending control commands to the tunnelkeeper daemon
pub struct IpcClient {
    socket_path: PathBuf,
    request_id: AtomicU64,
}

impl IpcClient {
    /// Create a new IPC client
    ///
    /// Note: This doesn't establish a connection. Each request creates a new connection.
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            request_id: AtomicU64::new(1),
        }
    }

    /// Connect to the daemon and verify it's running
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let client = Self::new(socket_path.to_path_buf());
        client.status().await?;
        Ok(client)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a raw JSON-RPC request
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let stream = connect_socket(&self.socket_path).await?;
        let (reader, mut writer) = stream.into_split();

        let request = RpcRequest::new(method, params, self.next_id());
        let request_json = serde_json::to_string(&request)?;
        debug!("Sending request: {}", request_json);

        writer.write_all(request_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let mut reader = BufReader::new(reader);
        let mut response_str = String::new();
        reader.read_line(&mut response_str).await?;
        debug!("Received response: {}", response_str.trim());

        let response: RpcResponse = serde_json::from_str(&response_str)
            .map_err(|e| IpcError::InvalidResponse(e.to_string()))?;

        if let Some(error) = response.error {
            return Err(IpcError::DaemonError {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
        let result = self
            .send_request(method, Some(serde_json::to_value(params)?))
            .await?;
        serde_json::from_value(result).map_err(|e| IpcError::InvalidResponse(e.to_string()))
    }

    async fn call_accepted<P: Serialize>(&self, method: &str, params: P) -> Result<bool> {
        let result: AcceptedResult = self.call(method, params).await?;
        Ok(result.accepted)
    }

    /// Start the tunnel with the config file at `config_path`.
    ///
    /// The daemon answers as soon as the start is scheduled; watch the
    /// state or poll [`status`](Self::status) for the outcome.
    pub async fn start(&self, config_path: PathBuf) -> Result<StartOutcome> {
        let result: StartResult = self.call(methods::START, StartParams { config_path }).await?;
        Ok(result.outcome)
    }

    /// Stop the tunnel. A manual stop suppresses automatic recovery until
    /// the next explicit start.
    pub async fn stop(&self, manual: bool) -> Result<StopOutcome> {
        let result: StopResult = self.call(methods::STOP, StopParams { manual }).await?;
        Ok(result.outcome)
    }

    /// Select `target`, or the next outbound in order when `None`.
    pub async fn switch_node(&self, target: Option<String>) -> Result<SwitchNodeResult> {
        self.call(methods::SWITCH_NODE, SwitchNodeParams { target }).await
    }

    pub async fn reset_connections(&self, reason: Option<String>) -> Result<bool> {
        self.call_accepted(methods::RESET_CONNECTIONS, ReasonParams { reason }).await
    }

    pub async fn network_bump(&self, reason: Option<String>) -> Result<bool> {
        self.call_accepted(methods::NETWORK_BUMP, ReasonParams { reason }).await
    }

    /// Returns false when throttled or when the tunnel is not running.
    pub async fn prepare_restart(&self, reason: Option<String>) -> Result<bool> {
        self.call_accepted(methods::PREPARE_RESTART, ReasonParams { reason }).await
    }

    pub async fn hot_reload(&self, config_content: String) -> Result<HotReloadReply> {
        self.call(methods::HOT_RELOAD, HotReloadParams { config_content }).await
    }

    /// Stop, then start again with a new config path. Waits for the start.
    pub async fn full_restart(&self, config_path: PathBuf) -> Result<()> {
        self.send_request(
            methods::FULL_RESTART,
            Some(serde_json::to_value(StartParams { config_path })?),
        )
        .await?;
        Ok(())
    }

    pub async fn recover(&self, mode: RecoveryMode, reason: Option<String>) -> Result<bool> {
        self.call_accepted(methods::RECOVER, RecoverParams { mode, reason }).await
    }

    pub async fn app_lifecycle(&self, foreground: bool) -> Result<bool> {
        self.call_accepted(methods::APP_LIFECYCLE, AppLifecycleParams { foreground }).await
    }

    pub async fn device_idle(&self, idle: bool) -> Result<bool> {
        self.call_accepted(methods::DEVICE_IDLE, DeviceIdleParams { idle }).await
    }

    /// Get current service status
    pub async fn status(&self) -> Result<StatusResult> {
        let result = self.send_request(methods::STATUS, None).await?;
        serde_json::from_value(result).map_err(|e| IpcError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = IpcClient::new(PathBuf::from("/tmp/test.sock"));
        assert_eq!(client.socket_path(), Path::new("/tmp/test.sock"));
    }

    #[test]
    fn test_request_id_increments() {
        let client = IpcClient::new(PathBuf::from("/tmp/test.sock"));
        assert_eq!(client.next_id(), 1);
        assert_eq!(client.next_id(), 2);
        assert_eq!(client.next_id(), 3);
    }

    #[tokio::test]
    async fn test_missing_socket_is_daemon_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let client = IpcClient::new(dir.path().join("absent.sock"));
        assert!(matches!(client.status().await, Err(IpcError::DaemonNotRunning)));
    }
}
