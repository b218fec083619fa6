//! IPC server for JSON-RPC communication
//!
//! Line-delimited JSON-RPC 2.0 over a Unix socket. Each connection runs a
//! request task; connections that call `subscribe` additionally get a
//! forwarding task that pushes `state_changed` events from the hub.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnelkeeper_core::protocol::{
    error_codes, methods, EventMessage, RpcRequest, RpcResponse, StatePayload, SubscribeResult,
    JSONRPC_VERSION, STATE_CHANGED_EVENT,
};
use tunnelkeeper_core::StateSnapshot;

use crate::hub::{ChannelSubscriber, StateHub, SubscriberId};
use crate::{DaemonError, Result};

/// Request handler behind the server. Errors become JSON-RPC error
/// responses with the message as-is.
pub trait IpcHandler: Send + Sync {
    fn handle(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<serde_json::Value, String>> + Send + '_>>;
}

/// IPC server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub socket_path: PathBuf,
}

impl Default for IpcConfig {
    fn default() -> Self {
        let path = if cfg!(target_os = "linux") {
            let runtime_dir =
                std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(format!("{}/tunnelkeeper.sock", runtime_dir))
        } else {
            PathBuf::from("/tmp/tunnelkeeper.sock")
        };

        Self { socket_path: path }
    }
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Per-connection subscription: hub registration plus its forwarding task.
struct Subscription {
    id: SubscriberId,
    forwarder: JoinHandle<()>,
}

/// IPC server with state streaming and graceful shutdown.
pub struct IpcServer {
    config: IpcConfig,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Option<mpsc::Receiver<()>>,
    hub: Option<Arc<StateHub>>,
}

impl IpcServer {
    pub fn new(config: IpcConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Self {
            config,
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
            hub: None,
        }
    }

    /// Enable `subscribe`/`unsubscribe` backed by `hub`.
    pub fn set_state_hub(&mut self, hub: Arc<StateHub>) {
        self.hub = Some(hub);
    }

    /// Sender that stops a running [`start`](Self::start) loop.
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept connections until shut down.
    pub async fn start<H: IpcHandler + 'static>(&mut self, handler: H) -> Result<()> {
        let mut shutdown_rx = self
            .shutdown_rx
            .take()
            .ok_or_else(|| DaemonError::IpcError("IPC server already started".to_string()))?;

        if self.config.socket_path.exists() {
            std::fs::remove_file(&self.config.socket_path)?;
        }
        if let Some(parent) = self.config.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.config.socket_path)
            .map_err(|e| DaemonError::IpcError(format!("Failed to bind: {}", e)))?;

        info!("IPC server listening on {:?}", self.config.socket_path);

        let handler = Arc::new(handler);
        let connections = CancellationToken::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let handler = handler.clone();
                            let hub = self.hub.clone();
                            let closed = connections.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler, hub, closed).await {
                                    warn!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("IPC server shutting down");
                    break;
                }
            }
        }

        connections.cancel();
        let _ = std::fs::remove_file(&self.config.socket_path);

        Ok(())
    }

    async fn handle_connection<H: IpcHandler + 'static>(
        stream: UnixStream,
        handler: Arc<H>,
        hub: Option<Arc<StateHub>>,
        closed: CancellationToken,
    ) -> Result<()> {
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let writer: SharedWriter = Arc::new(Mutex::new(writer));

        let mut subscription: Option<Subscription> = None;
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = tokio::select! {
                _ = closed.cancelled() => break,
                result = reader.read_line(&mut line) => match result {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Read error: {}", e);
                        break;
                    }
                },
            };

            if bytes_read == 0 {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }

            debug!("Received: {}", line.trim());

            // A successful subscribe hands back the receiver; the forwarder
            // starts only after the response line is written.
            let mut new_stream = None;

            let response = match serde_json::from_str::<RpcRequest>(&line) {
                Ok(request) if request.jsonrpc != JSONRPC_VERSION => RpcResponse::error(
                    request.id,
                    error_codes::INVALID_REQUEST,
                    "Invalid Request: jsonrpc must be '2.0'".to_string(),
                ),
                Ok(request) => match request.method.as_str() {
                    methods::SUBSCRIBE => match (&hub, &subscription) {
                        (None, _) => RpcResponse::error(
                            request.id,
                            error_codes::SERVER_ERROR,
                            "State hub not available".to_string(),
                        ),
                        (Some(_), Some(existing)) => subscribed_response(request.id, existing.id),
                        (Some(hub), None) => {
                            let (subscriber, rx) = ChannelSubscriber::new();
                            let id = hub.register(Arc::new(subscriber));
                            debug!("Connection subscribed as {:?}", id);
                            new_stream = Some((id, rx));
                            subscribed_response(request.id, id)
                        }
                    },
                    methods::UNSUBSCRIBE => {
                        let removed = match (&hub, subscription.take()) {
                            (Some(hub), Some(sub)) => {
                                sub.forwarder.abort();
                                hub.unregister(sub.id)
                            }
                            _ => false,
                        };
                        RpcResponse::success(request.id, serde_json::json!({ "unsubscribed": removed }))
                    }
                    _ => match handler.handle(&request.method, request.params).await {
                        Ok(result) => RpcResponse::success(request.id, result),
                        Err(msg) => RpcResponse::error(request.id, error_codes::SERVER_ERROR, msg),
                    },
                },
                Err(e) => RpcResponse::error(
                    serde_json::Value::Null,
                    error_codes::PARSE_ERROR,
                    format!("Parse error: {}", e),
                ),
            };

            let response_str = match serde_json::to_string(&response) {
                Ok(s) => s,
                Err(e) => {
                    error!("Serialize error: {}", e);
                    break;
                }
            };

            debug!("Sending: {}", response_str);
            if write_line(&writer, &response_str).await.is_err() {
                break;
            }

            if let Some((id, rx)) = new_stream {
                subscription = Some(Subscription {
                    id,
                    forwarder: spawn_forwarder(writer.clone(), rx),
                });
            }
        }

        if let Some(sub) = subscription {
            sub.forwarder.abort();
            if let Some(hub) = &hub {
                hub.unregister(sub.id);
            }
        }

        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.config.socket_path
    }
}

fn subscribed_response(id: serde_json::Value, subscriber: SubscriberId) -> RpcResponse {
    let result = SubscribeResult { subscribed: true, subscriber_id: subscriber.0 };
    match serde_json::to_value(result) {
        Ok(value) => RpcResponse::success(id, value),
        Err(e) => RpcResponse::error(id, error_codes::SERVER_ERROR, format!("Serialize error: {}", e)),
    }
}

async fn write_line(writer: &SharedWriter, line: &str) -> std::io::Result<()> {
    let mut w = writer.lock().await;
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await
}

fn spawn_forwarder(
    writer: SharedWriter,
    mut rx: mpsc::Receiver<StateSnapshot>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(snapshot) = rx.recv().await {
            let event = EventMessage {
                event: STATE_CHANGED_EVENT.to_string(),
                data: match serde_json::to_value(StatePayload::from(&snapshot)) {
                    Ok(data) => data,
                    Err(e) => {
                        error!("Serialize error: {}", e);
                        continue;
                    }
                },
            };
            let Ok(line) = serde_json::to_string(&event) else {
                continue;
            };
            if write_line(&writer, &line).await.is_err() {
                break;
            }
        }
    })
}
