//! StateWatcher against a scripted daemon socket:
//!   1. Pushed snapshots reach the watch channel
//!   2. A dropped connection reconnects and resets the attempt counter
//!   3. A vanished daemon with a live tunnel keeps the RUNNING snapshot
//!   4. A vanished daemon without a tunnel falls back to the durable store

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::time::timeout;

use tunnelkeeper_core::ServiceState;
use tunnelkeeper_ipc_client::{StateWatcher, TunnelPresence, WatchConfig};
use tunnelkeeper_store::StateStore;

struct FakePresence(AtomicBool);

impl TunnelPresence for FakePresence {
    fn tunnel_active(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

fn fast() -> WatchConfig {
    WatchConfig {
        base_delay: Duration::from_millis(20),
        max_attempts: 3,
    }
}

struct FakeConnection {
    _reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FakeConnection {
    async fn push(&mut self, state: u8, label: &str, version: u64) {
        let line = serde_json::json!({
            "event": "state_changed",
            "data": {
                "state": state,
                "active_label": label,
                "last_error": "",
                "manually_stopped": false,
                "version": version,
            }
        });
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }
}

/// Accept one connection and answer its subscribe request.
async fn accept_subscriber(listener: &UnixListener) -> FakeConnection {
    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("Timeout waiting for subscriber")
        .unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let request: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(request["method"], "subscribe");

    let response = serde_json::json!({
        "jsonrpc": "2.0",
        "result": {"subscribed": true, "subscriber_id": 1},
        "id": request["id"],
    });
    writer
        .write_all(format!("{}\n", response).as_bytes())
        .await
        .unwrap();
    FakeConnection { _reader: reader, writer }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let reached = timeout(Duration::from_secs(5), async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "Timeout: {}", what);
}

fn bind_listener(path: &Path) -> UnixListener {
    UnixListener::bind(path).unwrap()
}

// ── Test 1: Pushes reach observers ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_01_pushes_reach_watch_channel() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("daemon.sock");
    let listener = bind_listener(&socket);

    let watcher = StateWatcher::new(&socket, fast());
    let mut rx = watcher.subscribe();
    watcher.bind();

    let mut conn = accept_subscriber(&listener).await;
    conn.push(1, "", 1).await;
    conn.push(2, "jp-1", 2).await;
    conn.push(1, "stale", 1).await;

    timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == ServiceState::Running))
        .await
        .expect("Timeout waiting for RUNNING")
        .unwrap();
    assert!(watcher.is_bound());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = watcher.snapshot();
    assert_eq!(snapshot.active_label, "jp-1");
    assert_eq!(snapshot.version, 2);

    watcher.unbind();
}

// ── Test 2: Reconnect after a dropped connection ────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_02_dropped_connection_reconnects() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("daemon.sock");
    let listener = bind_listener(&socket);

    let watcher = StateWatcher::new(&socket, fast());
    watcher.bind();

    let mut conn = accept_subscriber(&listener).await;
    conn.push(2, "jp-1", 9).await;
    wait_until("running", || watcher.snapshot().state == ServiceState::Running).await;
    drop(conn);

    // A restarted daemon starts counting versions again.
    let mut conn = accept_subscriber(&listener).await;
    wait_until("bound again", || watcher.is_bound()).await;
    assert_eq!(watcher.attempts(), 0);
    assert!(!watcher.is_degraded());

    conn.push(2, "us-3", 1).await;
    wait_until("new label", || watcher.snapshot().active_label == "us-3").await;

    watcher.unbind();
}

// ── Test 3: Tunnel still present ────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_03_live_tunnel_keeps_running_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("daemon.sock");
    let listener = bind_listener(&socket);

    let presence = Arc::new(FakePresence(AtomicBool::new(true)));
    let watcher = StateWatcher::with_fallbacks(&socket, fast(), Some(presence.clone()), None);
    watcher.bind();

    let mut conn = accept_subscriber(&listener).await;
    conn.push(2, "jp-1", 3).await;
    wait_until("running", || watcher.snapshot().state == ServiceState::Running).await;

    drop(conn);
    drop(listener);
    std::fs::remove_file(&socket).unwrap();

    wait_until("degraded", || watcher.is_degraded()).await;
    assert!(!watcher.is_bound());
    assert_eq!(watcher.attempts(), 3);
    assert_eq!(watcher.snapshot().state, ServiceState::Running);
    assert_eq!(watcher.snapshot().active_label, "jp-1");

    // An explicit rebind finds the daemon again.
    let listener = bind_listener(&socket);
    watcher.rebind();
    let mut conn = accept_subscriber(&listener).await;
    conn.push(0, "", 1).await;
    wait_until("stopped via daemon", || watcher.snapshot().state == ServiceState::Stopped).await;
    assert!(!watcher.is_degraded());

    watcher.unbind();
}

// ── Test 4: Durable store fallback ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_04_store_fallback_without_tunnel() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("daemon.sock");
    let listener = bind_listener(&socket);
    let store = StateStore::open(dir.path().join("state")).unwrap();

    let presence = Arc::new(FakePresence(AtomicBool::new(false)));
    let watcher = StateWatcher::with_fallbacks(
        &socket,
        fast(),
        Some(presence),
        Some(store.clone()),
    );
    watcher.bind();

    let mut conn = accept_subscriber(&listener).await;
    conn.push(2, "jp-1", 3).await;
    wait_until("running", || watcher.snapshot().state == ServiceState::Running).await;

    store.set_active(false).unwrap();
    store.set_last_error("engine crashed").unwrap();
    drop(conn);

    wait_until("store fallback", || watcher.snapshot().last_error == "engine crashed").await;
    assert_eq!(watcher.snapshot().state, ServiceState::Stopped);

    watcher.unbind();
    drop(listener);
}
