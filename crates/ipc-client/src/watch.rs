//! Reconnecting observer of the daemon's state broadcasts
//!
//! [`StateWatcher`] holds a `subscribe` connection to the daemon and keeps
//! the latest [`StateSnapshot`] in a `tokio::sync::watch`. When the
//! connection drops it reconnects after `attempt * base_delay`, up to
//! `max_attempts` times, and then stays degraded until
//! [`rebind`](StateWatcher::rebind). While unbound the published snapshot
//! comes from the fallback chain: a tunnel interface that is still present
//! keeps the last RUNNING snapshot, otherwise the durable store is read,
//! otherwise the state is STOPPED.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::OwnedReadHalf;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnelkeeper_core::protocol::{
    methods, RpcRequest, ServerMessage, StatePayload, STATE_CHANGED_EVENT,
};
use tunnelkeeper_core::{ServiceState, StateSnapshot};
use tunnelkeeper_store::StateStore;

use crate::client::connect_socket;
use crate::presence::TunnelPresence;
use crate::{IpcError, Result};

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_attempts: 3,
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based).
pub fn reconnect_delay(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(attempt)
}

#[derive(Default)]
struct WatchState {
    bound: bool,
    attempts: u32,
    degraded: bool,
    generation: u64,
    supervisor: Option<CancellationToken>,
    /// Highest version seen on the current connection
    session_version: Option<u64>,
}

struct WatchInner {
    socket_path: PathBuf,
    config: WatchConfig,
    presence: Option<Arc<dyn TunnelPresence>>,
    store: Option<StateStore>,
    state: Mutex<WatchState>,
    tx: watch::Sender<StateSnapshot>,
    request_id: AtomicU64,
}

/// A live subscribe connection. `liveness` resolves when the daemon side
/// goes away.
struct Session {
    reader: JoinHandle<()>,
    liveness: oneshot::Receiver<()>,
}

#[derive(Clone)]
pub struct StateWatcher {
    inner: Arc<WatchInner>,
}

impl StateWatcher {
    pub fn new(socket_path: impl Into<PathBuf>, config: WatchConfig) -> Self {
        Self::with_fallbacks(socket_path, config, None, None)
    }

    pub fn with_fallbacks(
        socket_path: impl Into<PathBuf>,
        config: WatchConfig,
        presence: Option<Arc<dyn TunnelPresence>>,
        store: Option<StateStore>,
    ) -> Self {
        let (tx, _) = watch::channel(StateSnapshot::default());
        let inner = Arc::new(WatchInner {
            socket_path: socket_path.into(),
            config,
            presence,
            store,
            state: Mutex::new(WatchState::default()),
            tx,
            request_id: AtomicU64::new(1),
        });
        inner.apply_fallback();
        Self { inner }
    }

    /// Start the connection supervisor. No-op if one is already running.
    /// Must be called within a tokio runtime.
    pub fn bind(&self) {
        let mut state = self.inner.state.lock();
        if state.supervisor.is_some() {
            return;
        }
        self.spawn_supervisor(&mut state);
    }

    /// Drop any current connection, clear the attempt counter and the
    /// degraded flag, and connect again.
    pub fn rebind(&self) {
        let mut state = self.inner.state.lock();
        if let Some(token) = state.supervisor.take() {
            token.cancel();
        }
        state.bound = false;
        state.attempts = 0;
        state.degraded = false;
        self.spawn_supervisor(&mut state);
    }

    /// Stop the supervisor. The supervisor keeps the watcher alive, so this
    /// is the way to shut it down.
    pub fn unbind(&self) {
        let mut state = self.inner.state.lock();
        if let Some(token) = state.supervisor.take() {
            token.cancel();
        }
        state.generation += 1;
        state.bound = false;
    }

    fn spawn_supervisor(&self, state: &mut WatchState) {
        state.generation += 1;
        let token = CancellationToken::new();
        state.supervisor = Some(token.clone());
        tokio::spawn(supervise(Arc::clone(&self.inner), token, state.generation));
    }

    pub fn is_bound(&self) -> bool {
        self.inner.state.lock().bound
    }

    pub fn attempts(&self) -> u32 {
        self.inner.state.lock().attempts
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.state.lock().degraded
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.inner.tx.subscribe()
    }
}

async fn supervise(inner: Arc<WatchInner>, token: CancellationToken, generation: u64) {
    loop {
        let opened = tokio::select! {
            _ = token.cancelled() => break,
            result = inner.open_session() => result,
        };

        match opened {
            Ok(Session { reader, liveness }) => {
                inner.on_bound(generation);
                tokio::select! {
                    _ = token.cancelled() => {
                        reader.abort();
                        break;
                    }
                    _ = liveness => info!("Daemon connection lost"),
                }
                reader.abort();
            }
            Err(e) => debug!("Subscribe to {:?} failed: {}", inner.socket_path, e),
        }

        if token.is_cancelled() {
            break;
        }
        let Some(delay) = inner.on_unbound(generation) else {
            break;
        };
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let mut state = inner.state.lock();
    if state.generation == generation {
        state.supervisor = None;
    }
}

impl WatchInner {
    async fn open_session(self: &Arc<Self>) -> Result<Session> {
        let stream = connect_socket(&self.socket_path).await?;
        let (reader, mut writer) = stream.into_split();

        let request = RpcRequest::new(
            methods::SUBSCRIBE,
            None,
            self.request_id.fetch_add(1, Ordering::Relaxed),
        );
        let request_json = serde_json::to_string(&request)?;
        writer.write_all(request_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        self.state.lock().session_version = None;
        let mut lines = BufReader::new(reader).lines();
        self.await_subscribed(&mut lines).await?;

        let (live_tx, live_rx) = oneshot::channel();
        let inner = Arc::clone(self);
        let reader = tokio::spawn(async move {
            // Dropping the write half would end the daemon's read loop.
            let _writer = writer;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => inner.handle_line(&line),
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Read error: {}", e);
                        break;
                    }
                }
            }
            let _ = live_tx.send(());
        });

        Ok(Session { reader, liveness: live_rx })
    }

    async fn await_subscribed(&self, lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<()> {
        loop {
            let Some(line) = lines.next_line().await? else {
                return Err(IpcError::RequestFailed(
                    "connection closed before subscribe response".to_string(),
                ));
            };
            if line.trim().is_empty() {
                continue;
            }
            let message: ServerMessage = serde_json::from_str(&line)
                .map_err(|e| IpcError::InvalidResponse(e.to_string()))?;
            match message {
                ServerMessage::Response(response) => {
                    if let Some(error) = response.error {
                        return Err(IpcError::DaemonError {
                            code: error.code,
                            message: error.message,
                        });
                    }
                    return Ok(());
                }
                ServerMessage::Event(_) => self.handle_line(&line),
            }
        }
    }

    fn handle_line(&self, line: &str) {
        let message = match serde_json::from_str::<ServerMessage>(line) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring unparseable line: {}", e);
                return;
            }
        };
        let ServerMessage::Event(event) = message else {
            return;
        };
        if event.event != STATE_CHANGED_EVENT {
            return;
        }
        let snapshot = match serde_json::from_value::<StatePayload>(event.data) {
            Ok(payload) => payload.into_snapshot(),
            Err(e) => {
                warn!("Malformed state payload: {}", e);
                return;
            }
        };

        // A restarted daemon counts versions from zero again, so ordering
        // only holds within one connection.
        {
            let mut state = self.state.lock();
            if state.session_version.is_some_and(|v| snapshot.version <= v) {
                return;
            }
            state.session_version = Some(snapshot.version);
        }
        debug!("State changed: {} (v{})", snapshot.state, snapshot.version);
        self.publish(snapshot);
    }

    fn on_bound(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        if state.attempts > 0 {
            info!("Reconnected to daemon after {} attempt(s)", state.attempts);
        }
        state.bound = true;
        state.attempts = 0;
        state.degraded = false;
    }

    /// Returns the delay before the next attempt, or `None` once the
    /// attempts are exhausted.
    fn on_unbound(&self, generation: u64) -> Option<Duration> {
        let next = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return None;
            }
            state.bound = false;
            if state.attempts >= self.config.max_attempts {
                state.degraded = true;
                warn!(
                    "Giving up on {:?} after {} attempts",
                    self.socket_path, state.attempts
                );
                None
            } else {
                state.attempts += 1;
                Some(reconnect_delay(state.attempts, self.config.base_delay))
            }
        };
        self.apply_fallback();
        next
    }

    fn apply_fallback(&self) {
        let last = self.tx.borrow().clone();
        if last.state == ServiceState::Running
            && self.presence.as_ref().is_some_and(|p| p.tunnel_active())
        {
            debug!("Daemon unreachable but tunnel interface present, keeping last snapshot");
            return;
        }

        let fallback = match &self.store {
            Some(store) => match store.load() {
                Ok(durable) => durable.to_snapshot(),
                Err(e) => {
                    warn!("Failed to read durable state: {}", e);
                    StateSnapshot::default()
                }
            },
            None => StateSnapshot::default(),
        };
        self.publish(StateSnapshot { version: last.version, ..fallback });
    }

    fn publish(&self, snapshot: StateSnapshot) {
        self.tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;

    struct FakePresence(AtomicBool);

    impl TunnelPresence for FakePresence {
        fn tunnel_active(&self) -> bool {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn fast() -> WatchConfig {
        WatchConfig {
            base_delay: Duration::from_millis(10),
            max_attempts: 3,
        }
    }

    #[test]
    fn test_reconnect_delay_is_linear() {
        let base = Duration::from_millis(500);
        assert_eq!(reconnect_delay(1, base), Duration::from_millis(500));
        assert_eq!(reconnect_delay(2, base), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(3, base), Duration::from_millis(1500));
    }

    proptest! {
        #[test]
        fn prop_reconnect_delay_grows(attempt in 1u32..1000, base_ms in 1u64..10_000) {
            let base = Duration::from_millis(base_ms);
            let delay = reconnect_delay(attempt, base);
            prop_assert_eq!(delay, base * attempt);
            prop_assert!(reconnect_delay(attempt + 1, base) > delay);
        }
    }

    #[test]
    fn test_initial_snapshot_comes_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.set_last_error("permission denied").unwrap();
        store.set_manually_stopped(true).unwrap();

        let watcher =
            StateWatcher::with_fallbacks(dir.path().join("none.sock"), fast(), None, Some(store));
        let snapshot = watcher.snapshot();
        assert_eq!(snapshot.state, ServiceState::Stopped);
        assert_eq!(snapshot.last_error, "permission denied");
        assert!(snapshot.manually_stopped);
    }

    #[test]
    fn test_presence_keeps_running_snapshot() {
        let presence = Arc::new(FakePresence(AtomicBool::new(true)));
        let watcher = StateWatcher::with_fallbacks("/nonexistent.sock", fast(), Some(presence.clone()), None);
        watcher.inner.publish(StateSnapshot {
            state: ServiceState::Running,
            active_label: "jp-1".into(),
            version: 4,
            ..Default::default()
        });

        watcher.inner.apply_fallback();
        assert_eq!(watcher.snapshot().state, ServiceState::Running);

        presence.0.store(false, Ordering::Relaxed);
        watcher.inner.apply_fallback();
        assert_eq!(watcher.snapshot().state, ServiceState::Stopped);
        assert_eq!(watcher.snapshot().version, 4);
    }

    #[test]
    fn test_stale_versions_dropped_within_session() {
        let watcher = StateWatcher::new("/nonexistent.sock", fast());
        let line = |state: u8, version: u64| {
            format!(
                r#"{{"event":"state_changed","data":{{"state":{},"active_label":"","last_error":"","manually_stopped":false,"version":{}}}}}"#,
                state, version
            )
        };
        watcher.inner.handle_line(&line(2, 5));
        watcher.inner.handle_line(&line(0, 3));
        assert_eq!(watcher.snapshot().state, ServiceState::Running);
        assert_eq!(watcher.snapshot().version, 5);

        watcher.inner.state.lock().session_version = None;
        watcher.inner.handle_line(&line(0, 1));
        assert_eq!(watcher.snapshot().state, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_unreachable_daemon_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = StateWatcher::new(dir.path().join("none.sock"), fast());
        watcher.bind();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !watcher.is_degraded() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!watcher.is_bound());
        assert_eq!(watcher.attempts(), 3);

        watcher.rebind();
        assert!(!watcher.is_degraded());
        assert_eq!(watcher.attempts(), 0);
        watcher.unbind();
    }
}
