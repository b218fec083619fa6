//! Physical network monitor
//!
//! Tracks the best non-tunnel uplink and hands it to the engine. Updates
//! are ignored for a grace window after the tunnel comes up, and repeated
//! propagation of the same network is debounced. A change of interface
//! name is reported to recovery as a `NetworkBump`.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnelkeeper_core::{NetworkCandidate, NetworkSnapshot, RecoveryRequest, Transport};

use crate::config::NetworkConfig;
use crate::recovery::RecoveryRequester;

/// Source of candidate networks.
pub trait NetworkProvider: Send + Sync {
    fn networks(&self) -> Vec<NetworkCandidate>;
}

/// Receives the chosen underlying network.
pub trait UnderlyingNetworkSink: Send + Sync {
    fn set_underlying_network(&self, network: Option<&NetworkSnapshot>);
}

/// In-memory provider for platforms that push network changes, and for tests.
#[derive(Default)]
pub struct StaticNetworkProvider {
    networks: Mutex<Vec<NetworkCandidate>>,
}

impl StaticNetworkProvider {
    pub fn new(networks: Vec<NetworkCandidate>) -> Self {
        Self { networks: Mutex::new(networks) }
    }

    pub fn set(&self, networks: Vec<NetworkCandidate>) {
        *self.networks.lock() = networks;
    }

    /// Add or replace (by handle) a network.
    pub fn upsert(&self, network: NetworkCandidate) {
        let mut networks = self.networks.lock();
        networks.retain(|n| n.handle != network.handle);
        networks.push(network);
    }

    pub fn remove(&self, handle: tunnelkeeper_core::NetworkHandle) {
        self.networks.lock().retain(|n| n.handle != handle);
    }
}

impl NetworkProvider for StaticNetworkProvider {
    fn networks(&self) -> Vec<NetworkCandidate> {
        self.networks.lock().clone()
    }
}

/// Score of a candidate, or `None` if it cannot carry the tunnel.
///
/// Validation adds more than the widest transport gap, so any validated
/// network outranks any unvalidated one.
pub fn score_network(candidate: &NetworkCandidate) -> Option<u8> {
    if !candidate.has_internet || candidate.transport == Transport::Vpn {
        return None;
    }
    let base = match candidate.transport {
        Transport::Ethernet => 3,
        Transport::Wifi => 2,
        Transport::Cellular => 1,
        Transport::Other | Transport::Vpn => 0,
    };
    Some(if candidate.validated { base + 4 } else { base })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Inside the post-start grace window
    StartupGrace,
    /// Same handle and interface as last time
    Unchanged,
    /// Interface renamed on the same handle, within the debounce window
    Debounced,
    Propagated { interface_changed: bool },
}

#[derive(Default)]
struct MonitorState {
    last_known: Option<NetworkSnapshot>,
    default_interface: String,
    last_propagated_at: Option<Instant>,
    started_at: Option<Instant>,
}

pub struct NetworkMonitor {
    config: NetworkConfig,
    provider: Arc<dyn NetworkProvider>,
    sink: Arc<dyn UnderlyingNetworkSink>,
    recovery: Option<Arc<dyn RecoveryRequester>>,
    state: Mutex<MonitorState>,
}

impl NetworkMonitor {
    pub fn new(
        config: NetworkConfig,
        provider: Arc<dyn NetworkProvider>,
        sink: Arc<dyn UnderlyingNetworkSink>,
    ) -> Self {
        Self {
            config,
            provider,
            sink,
            recovery: None,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn with_recovery(mut self, recovery: Arc<dyn RecoveryRequester>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn last_known(&self) -> Option<NetworkSnapshot> {
        self.state.lock().last_known.clone()
    }

    pub fn default_interface_name(&self) -> String {
        self.state.lock().default_interface.clone()
    }

    /// Highest-scoring eligible network. Ties go to the last known one.
    pub fn find_best_physical_network(&self) -> Option<NetworkCandidate> {
        let last_handle = self.state.lock().last_known.as_ref().map(|n| n.handle);
        self.provider
            .networks()
            .into_iter()
            .filter_map(|c| score_network(&c).map(|score| (score, c)))
            .max_by_key(|(score, c)| (*score, Some(c.handle) == last_handle))
            .map(|(_, c)| c)
    }

    /// Start of a tunnel run: opens the grace window and hands the engine
    /// the current best network.
    pub fn mark_tunnel_started(&self) -> Option<NetworkSnapshot> {
        let best = self.find_best_physical_network();
        let now = Instant::now();
        let mut state = self.state.lock();
        state.started_at = Some(now);
        let snapshot = best.as_ref().map(NetworkSnapshot::from)?;
        self.sink.set_underlying_network(Some(&snapshot));
        state.default_interface = snapshot.interface_name.clone();
        state.last_known = Some(snapshot.clone());
        state.last_propagated_at = Some(now);
        info!("Underlying network at start: {} ({})", snapshot.interface_name, snapshot.handle);
        Some(snapshot)
    }

    pub fn update_default_interface(&self, candidate: &NetworkCandidate) -> UpdateOutcome {
        let now = Instant::now();
        let snapshot = NetworkSnapshot::from(candidate);

        let mut state = self.state.lock();
        if state
            .started_at
            .is_some_and(|at| now.duration_since(at) < self.config.startup_grace)
        {
            debug!("Ignoring network update for {} during startup grace", snapshot.interface_name);
            return UpdateOutcome::StartupGrace;
        }

        let handle_changed = state.last_known.as_ref().map(|n| n.handle) != Some(snapshot.handle);
        let name_changed = state.default_interface != snapshot.interface_name;

        if !handle_changed && !name_changed {
            state.last_known = Some(snapshot);
            return UpdateOutcome::Unchanged;
        }

        if !handle_changed
            && state
                .last_propagated_at
                .is_some_and(|at| now.duration_since(at) < self.config.debounce)
        {
            debug!("Debounced interface change to {}", snapshot.interface_name);
            return UpdateOutcome::Debounced;
        }

        self.sink.set_underlying_network(Some(&snapshot));
        state.last_propagated_at = Some(now);
        let previous = std::mem::replace(&mut state.default_interface, snapshot.interface_name.clone());
        state.last_known = Some(snapshot.clone());
        drop(state);

        let interface_changed = name_changed && !previous.is_empty();
        info!(
            "Underlying network -> {} ({}){}",
            snapshot.interface_name,
            snapshot.handle,
            if interface_changed { format!(", was {}", previous) } else { String::new() }
        );

        if interface_changed {
            if let Some(recovery) = &self.recovery {
                recovery.request(RecoveryRequest::network_bump(format!(
                    "network_change: {} -> {}",
                    previous, snapshot.interface_name
                )));
            }
        }

        UpdateOutcome::Propagated { interface_changed }
    }

    /// One monitor tick. Returns `None` when no eligible network exists.
    pub fn poll_once(&self) -> Option<UpdateOutcome> {
        match self.find_best_physical_network() {
            Some(best) => Some(self.update_default_interface(&best)),
            None => {
                if let Some(lost) = self.state.lock().last_known.take() {
                    warn!("Physical network lost: {} ({})", lost.interface_name, lost.handle);
                }
                None
            }
        }
    }

    /// Re-send the last known network to the engine.
    pub fn reassert(&self) -> bool {
        let mut state = self.state.lock();
        match state.last_known.clone() {
            Some(network) => {
                self.sink.set_underlying_network(Some(&network));
                state.last_propagated_at = Some(Instant::now());
                debug!("Re-asserted underlying network {}", network.interface_name);
                true
            }
            None => false,
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = MonitorState::default();
    }

    /// Poll on the configured interval until `token` is cancelled.
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.poll_once();
                    }
                }
            }
            debug!("Network monitor loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tunnelkeeper_core::NetworkHandle;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<Option<String>>>,
    }

    impl UnderlyingNetworkSink for RecordingSink {
        fn set_underlying_network(&self, network: Option<&NetworkSnapshot>) {
            self.calls.lock().push(network.map(|n| n.interface_name.clone()));
        }
    }

    #[derive(Default)]
    struct RecordingRequester {
        requests: Mutex<Vec<RecoveryRequest>>,
    }

    impl RecoveryRequester for RecordingRequester {
        fn request(&self, request: RecoveryRequest) {
            self.requests.lock().push(request);
        }
    }

    fn net(id: u64, name: &str, transport: Transport, validated: bool) -> NetworkCandidate {
        NetworkCandidate {
            handle: NetworkHandle(id),
            interface_name: name.to_string(),
            transport,
            has_internet: true,
            validated,
            is_expensive: transport == Transport::Cellular,
            is_constrained: false,
        }
    }

    struct Fixture {
        provider: Arc<StaticNetworkProvider>,
        sink: Arc<RecordingSink>,
        requester: Arc<RecordingRequester>,
        monitor: Arc<NetworkMonitor>,
    }

    fn fixture(networks: Vec<NetworkCandidate>) -> Fixture {
        let provider = Arc::new(StaticNetworkProvider::new(networks));
        let sink = Arc::new(RecordingSink::default());
        let requester = Arc::new(RecordingRequester::default());
        let monitor = Arc::new(
            NetworkMonitor::new(NetworkConfig::default(), provider.clone(), sink.clone())
                .with_recovery(requester.clone()),
        );
        Fixture { provider, sink, requester, monitor }
    }

    #[test]
    fn test_scoring_order() {
        let eth = net(1, "eth0", Transport::Ethernet, true);
        let wifi = net(2, "wlan0", Transport::Wifi, true);
        let cell_unvalidated = net(3, "rmnet0", Transport::Cellular, false);
        let other_validated = net(4, "usb0", Transport::Other, true);
        let eth_unvalidated = net(5, "eth1", Transport::Ethernet, false);

        assert!(score_network(&eth) > score_network(&wifi));
        assert!(score_network(&other_validated) > score_network(&eth_unvalidated));
        assert!(score_network(&eth_unvalidated) > score_network(&cell_unvalidated));
    }

    #[test]
    fn test_vpn_and_offline_networks_excluded() {
        let vpn = net(1, "tun0", Transport::Vpn, true);
        let mut offline = net(2, "wlan0", Transport::Wifi, true);
        offline.has_internet = false;
        assert_eq!(score_network(&vpn), None);
        assert_eq!(score_network(&offline), None);

        let f = fixture(vec![vpn, offline]);
        assert!(f.monitor.find_best_physical_network().is_none());
    }

    #[test]
    fn test_tie_prefers_last_known() {
        let f = fixture(vec![
            net(1, "wlan0", Transport::Wifi, true),
            net(2, "wlan1", Transport::Wifi, true),
        ]);
        f.monitor.update_default_interface(&net(2, "wlan1", Transport::Wifi, true));
        let best = f.monitor.find_best_physical_network().unwrap();
        assert_eq!(best.handle, NetworkHandle(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_better_network_propagates_once() {
        let f = fixture(vec![net(1, "wlan0", Transport::Wifi, true)]);
        assert!(matches!(f.monitor.poll_once(), Some(UpdateOutcome::Propagated { .. })));

        f.provider.upsert(net(2, "eth0", Transport::Ethernet, true));
        let best = f.monitor.find_best_physical_network().unwrap();
        assert_eq!(best.handle, NetworkHandle(2));

        assert_eq!(
            f.monitor.update_default_interface(&best),
            UpdateOutcome::Propagated { interface_changed: true }
        );
        assert_eq!(f.monitor.update_default_interface(&best), UpdateOutcome::Unchanged);
        assert_eq!(
            *f.sink.calls.lock(),
            vec![Some("wlan0".to_string()), Some("eth0".to_string())]
        );
        assert_eq!(f.requester.requests.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_assignment_is_not_an_interface_change() {
        let f = fixture(vec![]);
        let outcome = f
            .monitor
            .update_default_interface(&net(1, "wlan0", Transport::Wifi, true));
        assert_eq!(outcome, UpdateOutcome::Propagated { interface_changed: false });
        assert!(f.requester.requests.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_grace_ignores_updates() {
        let f = fixture(vec![net(1, "wlan0", Transport::Wifi, true)]);
        let seeded = f.monitor.mark_tunnel_started().unwrap();
        assert_eq!(seeded.interface_name, "wlan0");

        let eth = net(2, "eth0", Transport::Ethernet, true);
        assert_eq!(f.monitor.update_default_interface(&eth), UpdateOutcome::StartupGrace);

        tokio::time::sleep(Duration::from_millis(3001)).await;
        assert!(matches!(
            f.monitor.update_default_interface(&eth),
            UpdateOutcome::Propagated { interface_changed: true }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_on_same_handle_is_debounced() {
        let f = fixture(vec![]);
        f.monitor.update_default_interface(&net(1, "wlan0", Transport::Wifi, true));

        let renamed = net(1, "wlan1", Transport::Wifi, true);
        assert_eq!(f.monitor.update_default_interface(&renamed), UpdateOutcome::Debounced);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            f.monitor.update_default_interface(&renamed),
            UpdateOutcome::Propagated { interface_changed: true }
        );
        let requests = f.requester.requests.lock();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].reason().starts_with("network_change"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_change_bypasses_debounce() {
        let f = fixture(vec![]);
        f.monitor.update_default_interface(&net(1, "wlan0", Transport::Wifi, true));
        let outcome = f
            .monitor
            .update_default_interface(&net(2, "wlan0", Transport::Wifi, true));
        assert_eq!(outcome, UpdateOutcome::Propagated { interface_changed: false });
        assert_eq!(f.sink.calls.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_clears_last_known_and_reassert() {
        let f = fixture(vec![net(1, "wlan0", Transport::Wifi, true)]);
        f.monitor.poll_once();
        assert!(f.monitor.reassert());
        assert_eq!(f.sink.calls.lock().len(), 2);

        f.provider.set(vec![]);
        assert_eq!(f.monitor.poll_once(), None);
        assert!(f.monitor.last_known().is_none());
        assert!(!f.monitor.reassert());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_stops_on_cancel() {
        let f = fixture(vec![net(1, "wlan0", Transport::Wifi, true)]);
        let token = CancellationToken::new();
        let handle = f.monitor.spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(f.monitor.default_interface_name(), "wlan0");

        token.cancel();
        handle.await.unwrap();
    }
}
