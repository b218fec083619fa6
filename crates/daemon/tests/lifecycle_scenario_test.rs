//! Lifecycle scenario tests against the stub engine:
//!   1. Start while STARTING runs the engine once
//!   2. Concurrent stops close the engine once
//!   3. Stop during STARTING cancels the start
//!   4. Start failure lands in lastError without retry
//!   5. Start during STOPPING is replayed afterwards
//!   6. Persistent stall refreshes, then restarts
//!   7. Manual stop suppresses stall recovery
//!   8. Bump with failing probes ends in the last resort
//!   9. Better physical network reaches the engine
//!  10. Manual stop flag survives a daemon restart
//!  11. Shutdown during a coordinator restart still closes the engine

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tempfile::TempDir;
use tokio::time::timeout;

use tunnelkeeper_core::protocol::{StartOutcome, StopOutcome};
use tunnelkeeper_core::{
    CoreMode, EngineError, NetworkCandidate, NetworkHandle, RecoveryRequest, ServiceState,
    StubEngine, Transport,
};
use tunnelkeeper_daemon::{CoordinatorConfig, DaemonService, StaticNetworkProvider};
use tunnelkeeper_store::StateStore;

fn fast_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.lifecycle.restart_delay = Duration::from_millis(20);
    config.network.startup_grace = Duration::ZERO;
    config.network.debounce = Duration::from_millis(50);
    config.network.poll_interval = Duration::from_millis(20);
    config.stall.sample_interval = Duration::from_millis(10);
    config.stall.check_interval = Duration::from_millis(50);
    config
}

fn network(id: u64, name: &str, transport: Transport) -> NetworkCandidate {
    NetworkCandidate {
        handle: NetworkHandle(id),
        interface_name: name.to_string(),
        transport,
        has_internet: true,
        validated: true,
        is_expensive: false,
        is_constrained: false,
    }
}

struct Fixture {
    dir: TempDir,
    config_path: PathBuf,
    engine: Arc<StubEngine>,
    provider: Arc<StaticNetworkProvider>,
    service: DaemonService,
}

fn fixture_with(engine: StubEngine, config: CoordinatorConfig, store: Option<StateStore>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("tunnel.json");
    std::fs::write(&config_path, r#"{"outbounds":[{"tag":"proxy"}]}"#).unwrap();
    let engine = Arc::new(engine);
    let provider = Arc::new(StaticNetworkProvider::new(vec![network(1, "wlan0", Transport::Wifi)]));
    let service = DaemonService::new(config, engine.clone(), provider.clone(), store);
    Fixture { dir, config_path, engine, provider, service }
}

fn fixture() -> Fixture {
    fixture_with(StubEngine::new(), fast_config(), None)
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

// ── Test 1: Start while STARTING ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_01_start_while_starting_runs_engine_once() {
    let fx = fixture_with(
        StubEngine::new().with_start_delay(Duration::from_millis(100)),
        fast_config(),
        None,
    );

    assert_eq!(fx.service.start(fx.config_path.clone()), StartOutcome::Started);
    assert_eq!(fx.service.state(), ServiceState::Starting);

    let outcomes = join_all((0..8).map(|_| {
        let service = fx.service.clone();
        let path = fx.config_path.clone();
        tokio::spawn(async move { service.start(path) })
    }))
    .await;
    assert!(outcomes
        .into_iter()
        .all(|o| o.unwrap() == StartOutcome::AlreadyActive));

    wait_until("service running", || fx.service.state() == ServiceState::Running).await;
    assert_eq!(fx.engine.calls().start, 1);
    assert_eq!(fx.service.start(fx.config_path.clone()), StartOutcome::AlreadyActive);
}

// ── Test 2: Concurrent stops ────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_02_concurrent_stops_close_engine_once() {
    let fx = fixture_with(
        StubEngine::new().with_close_delay(Duration::from_millis(100)),
        fast_config(),
        None,
    );
    fx.service.start_and_wait(fx.config_path.clone()).await.unwrap();

    let outcomes: Vec<StopOutcome> = join_all((0..8).map(|_| {
        let service = fx.service.clone();
        async move { service.stop(false).await }
    }))
    .await;

    assert_eq!(outcomes.iter().filter(|o| **o == StopOutcome::Stopped).count(), 1);
    assert_eq!(
        outcomes.iter().filter(|o| **o == StopOutcome::AlreadyStopping).count(),
        7
    );
    assert_eq!(fx.engine.calls().close, 1);
    assert_eq!(fx.service.state(), ServiceState::Stopped);
}

// ── Test 3: Stop during STARTING ────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_03_stop_cancels_in_flight_start() {
    let fx = fixture_with(
        StubEngine::new().with_start_delay(Duration::from_millis(200)),
        fast_config(),
        None,
    );

    fx.service.start(fx.config_path.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fx.service.stop(false).await, StopOutcome::Stopped);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fx.service.state(), ServiceState::Stopped);
    assert!(!fx.engine.is_started());
    assert!(fx.service.snapshot().last_error.is_empty());
}

// ── Test 4: Start failure ───────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_04_start_failure_sets_last_error() {
    let fx = fixture();
    fx.engine
        .fail_next_start(EngineError::PermissionDenied("tun device".to_string()));

    assert!(fx.service.start_and_wait(fx.config_path.clone()).await.is_err());
    assert_eq!(fx.service.state(), ServiceState::Stopped);
    assert!(fx.service.snapshot().last_error.contains("tun device"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fx.engine.calls().start, 1, "start failures are not retried");

    fx.service.start_and_wait(fx.config_path.clone()).await.unwrap();
    assert!(fx.service.snapshot().last_error.is_empty());
}

// ── Test 5: Start queued behind a stop ──────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_05_start_during_stop_is_replayed() {
    let fx = fixture_with(
        StubEngine::new().with_close_delay(Duration::from_millis(150)),
        fast_config(),
        None,
    );
    fx.service.start_and_wait(fx.config_path.clone()).await.unwrap();

    let stopping = {
        let service = fx.service.clone();
        tokio::spawn(async move { service.stop(false).await })
    };
    wait_until("service stopping", || fx.service.state() == ServiceState::Stopping).await;
    assert_eq!(fx.service.start(fx.config_path.clone()), StartOutcome::Queued);

    assert_eq!(stopping.await.unwrap(), StopOutcome::Stopped);
    wait_until("service running again", || fx.service.state() == ServiceState::Running).await;
    assert_eq!(fx.engine.calls().start, 2);
    assert_eq!(fx.engine.calls().close, 1);
}

// ── Test 6: Stall escalation ────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_06_persistent_stall_refreshes_then_restarts() {
    let mut config = fast_config();
    config.stall.max_refresh_attempts = 1;
    let fx = fixture_with(StubEngine::new(), config, None);
    fx.service.start_and_wait(fx.config_path.clone()).await.unwrap();

    fx.engine.set_traffic_flowing(false);

    wait_until("refresh recovery", || fx.engine.calls().recover_full >= 1).await;
    assert_eq!(fx.engine.calls().start, 1);

    wait_until("restart", || fx.engine.calls().start == 2).await;
    wait_until("running after restart", || fx.service.state() == ServiceState::Running).await;
    assert_eq!(fx.engine.calls().close, 1);
}

// ── Test 7: Manual stop beats stall recovery ────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_07_manual_stop_suppresses_stall_restart() {
    let mut config = fast_config();
    config.stall.max_refresh_attempts = 0;
    let fx = fixture_with(StubEngine::new(), config, None);
    fx.service.start_and_wait(fx.config_path.clone()).await.unwrap();

    fx.engine.set_traffic_flowing(false);
    fx.service.stop(true).await;
    assert!(fx.service.snapshot().manually_stopped);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fx.engine.calls().start, 1);
    assert_eq!(fx.service.state(), ServiceState::Stopped);
}

// ── Test 8: NetworkBump last resort ─────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_08_bump_with_failing_probes_runs_last_resort() {
    let fx = fixture();
    fx.service.start_and_wait(fx.config_path.clone()).await.unwrap();
    fx.engine.set_default_probe(None);
    fx.engine.set_tracked_connections(5);

    assert!(fx.service.network_bump("manual"));
    fx.service.recovery().wait_idle().await;

    let calls = fx.engine.calls();
    assert_eq!(calls.close_all_tracked, 1);
    assert_eq!(calls.recover_quick, 1);
    assert_eq!(calls.recover_full, 0, "hard step needs a doze exit or recent pause");
    assert_eq!(fx.service.state(), ServiceState::Running);
}

// ── Test 9: Network change propagation ──────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_09_better_network_reaches_engine() {
    let fx = fixture();
    fx.service.start_and_wait(fx.config_path.clone()).await.unwrap();
    assert_eq!(
        fx.engine.underlying_network().map(|n| n.interface_name),
        Some("wlan0".to_string())
    );

    fx.provider.upsert(network(2, "eth0", Transport::Ethernet));
    wait_until("ethernet propagated", || {
        fx.engine.underlying_network().is_some_and(|n| n.interface_name == "eth0")
    })
    .await;
    wait_until("status reports ethernet", || {
        fx.service.status().underlying_interface.as_deref() == Some("eth0")
    })
    .await;
}

// ── Test 10: Durable manual stop ────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_10_manual_stop_survives_daemon_restart() {
    let state_dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(state_dir.path()).unwrap();

    let fx = fixture_with(StubEngine::new(), fast_config(), Some(store.clone()));
    fx.service.start_and_wait(fx.config_path.clone()).await.unwrap();
    fx.service.hub().flushed().await;
    let durable = store.load().unwrap();
    assert!(durable.active);
    assert_eq!(durable.mode, CoreMode::Tunnel);

    fx.service.stop(true).await;
    fx.service.shutdown().await;
    let durable = store.load().unwrap();
    assert!(!durable.active);
    assert!(durable.manually_stopped);
    assert_eq!(durable.mode, CoreMode::None);

    let reopened = StateStore::open(state_dir.path()).unwrap();
    let service = DaemonService::new(
        fast_config(),
        Arc::new(StubEngine::new()),
        fx.provider.clone(),
        Some(reopened),
    );
    assert!(service.snapshot().manually_stopped);

    service.start_and_wait(fx.config_path.clone()).await.unwrap();
    assert!(!service.snapshot().manually_stopped);
    service.hub().flushed().await;
    assert!(!store.load().unwrap().manually_stopped);
    drop(fx.dir);
}

// ── Test 11: Shutdown during a coordinator restart ──────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_11_shutdown_during_restart_closes_engine() {
    let state_dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(state_dir.path()).unwrap();
    let engine = StubEngine::new().with_close_delay(Duration::from_millis(500));
    let fx = fixture_with(engine, fast_config(), Some(store.clone()));
    fx.service.start_and_wait(fx.config_path.clone()).await.unwrap();

    fx.service.recovery().request(RecoveryRequest::restart("traffic_stall"));
    wait_until("restart reaches STOPPING", || {
        fx.service.state() == ServiceState::Stopping
    })
    .await;

    timeout(Duration::from_secs(5), fx.service.shutdown())
        .await
        .expect("Timeout: shutdown hung");

    assert_eq!(fx.service.state(), ServiceState::Stopped);
    let calls = fx.engine.calls();
    assert_eq!(calls.close, 1);
    assert_eq!(calls.start, 1, "restart must not bring the engine back up");

    let durable = store.load().unwrap();
    assert!(!durable.active);
    assert!(durable.pending.is_empty());
    assert_eq!(durable.mode, CoreMode::None);
}
