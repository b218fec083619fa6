//! In-memory engine used by the daemon binary when no packet engine is
//! linked, and by tests to script probe outcomes and count side effects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::engine::{EngineError, EngineHandle, TunnelEngine, TunnelFd, TunnelOptions};
use crate::types::{NetworkSnapshot, RecoveryMode, SwitchResult, TrafficTotals};

/// Bytes added to each counter per `traffic_totals` read while traffic flows
const SIMULATED_BYTES_PER_READ: u64 = 4096;

/// Call counters recorded by [`StubEngine`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineCalls {
    pub start: usize,
    pub close: usize,
    pub open_tunnel: usize,
    pub wake: usize,
    pub pause: usize,
    pub close_idle: usize,
    pub close_all_tracked: usize,
    pub recover_quick: usize,
    pub recover_full: usize,
    pub recover_deep: usize,
    pub recover_proactive: usize,
    pub recover_auto: usize,
    pub reset_all_connections: usize,
    pub reset_network: usize,
    pub url_test: usize,
    pub select_outbound: usize,
    pub hot_reload: usize,
    pub set_underlying: usize,
}

impl EngineCalls {
    pub fn recover_total(&self) -> usize {
        self.recover_quick
            + self.recover_full
            + self.recover_deep
            + self.recover_proactive
            + self.recover_auto
    }
}

struct StubState {
    calls: EngineCalls,
    journal: Vec<String>,
    running: Option<EngineHandle>,
    start_error: Option<EngineError>,
    probe_script: VecDeque<Option<u32>>,
    default_probe: Option<u32>,
    idle_connections: usize,
    tracked_connections: usize,
    paused: bool,
    last_paused_at: Option<Instant>,
    traffic_flowing: bool,
    totals: TrafficTotals,
    outbounds: Vec<String>,
    selected: Option<String>,
    select_result: SwitchResult,
    hot_reload_result: Result<bool, EngineError>,
    underlying: Option<NetworkSnapshot>,
}

/// Scriptable engine with no data path.
pub struct StubEngine {
    state: Mutex<StubState>,
    start_delay: Duration,
    close_delay: Duration,
    next_handle: AtomicU64,
}

impl StubEngine {
    pub fn new() -> Self {
        let outbounds = vec!["direct".to_string(), "proxy-a".to_string(), "proxy-b".to_string()];
        Self {
            state: Mutex::new(StubState {
                calls: EngineCalls::default(),
                journal: Vec::new(),
                running: None,
                start_error: None,
                probe_script: VecDeque::new(),
                default_probe: Some(42),
                idle_connections: 0,
                tracked_connections: 0,
                paused: false,
                last_paused_at: None,
                traffic_flowing: true,
                totals: TrafficTotals::default(),
                selected: outbounds.first().cloned(),
                outbounds,
                select_result: SwitchResult::Success,
                hot_reload_result: Ok(true),
                underlying: None,
            }),
            start_delay: Duration::ZERO,
            close_delay: Duration::ZERO,
            next_handle: AtomicU64::new(1),
        }
    }

    /// Delay applied inside `start` to simulate engine bring-up.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    pub fn with_outbounds(self, outbounds: Vec<String>) -> Self {
        {
            let mut state = self.state.lock();
            state.selected = outbounds.first().cloned();
            state.outbounds = outbounds;
        }
        self
    }

    pub fn calls(&self) -> EngineCalls {
        self.state.lock().calls.clone()
    }

    /// Ordered names of the mutating calls made so far.
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().journal.clone()
    }

    pub fn fail_next_start(&self, error: EngineError) {
        self.state.lock().start_error = Some(error);
    }

    /// Probe outcomes consumed in order before falling back to the default.
    pub fn script_probes(&self, results: impl IntoIterator<Item = Option<u32>>) {
        self.state.lock().probe_script.extend(results);
    }

    pub fn set_default_probe(&self, result: Option<u32>) {
        self.state.lock().default_probe = result;
    }

    pub fn set_idle_connections(&self, count: usize) {
        self.state.lock().idle_connections = count;
    }

    pub fn set_tracked_connections(&self, count: usize) {
        self.state.lock().tracked_connections = count;
    }

    pub fn set_traffic_flowing(&self, flowing: bool) {
        self.state.lock().traffic_flowing = flowing;
    }

    pub fn set_select_result(&self, result: SwitchResult) {
        self.state.lock().select_result = result;
    }

    pub fn set_hot_reload_result(&self, result: Result<bool, EngineError>) {
        self.state.lock().hot_reload_result = result;
    }

    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock();
        state.paused = paused;
        if paused {
            state.last_paused_at = Some(Instant::now());
        }
    }

    pub fn underlying_network(&self) -> Option<NetworkSnapshot> {
        self.state.lock().underlying.clone()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().running.is_some()
    }

    fn record(state: &mut StubState, entry: &str) {
        debug!("stub engine: {}", entry);
        state.journal.push(entry.to_string());
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelEngine for StubEngine {
    async fn start(&self, config: &str) -> Result<EngineHandle, EngineError> {
        {
            let mut state = self.state.lock();
            state.calls.start += 1;
            Self::record(&mut state, "start");
            if let Some(err) = state.start_error.take() {
                return Err(err);
            }
        }
        if config.trim().is_empty() {
            return Err(EngineError::InvalidConfig("empty configuration".to_string()));
        }
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        let handle = EngineHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.state.lock().running = Some(handle);
        Ok(handle)
    }

    async fn close(&self, handle: EngineHandle) -> Result<(), EngineError> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        let mut state = self.state.lock();
        state.calls.close += 1;
        Self::record(&mut state, "close");
        match state.running {
            Some(current) if current == handle => {
                state.running = None;
                Ok(())
            }
            _ => Err(EngineError::NotStarted),
        }
    }

    async fn open_tunnel_descriptor(
        &self,
        _options: &TunnelOptions,
    ) -> Result<TunnelFd, EngineError> {
        let mut state = self.state.lock();
        state.calls.open_tunnel += 1;
        Self::record(&mut state, "open_tunnel");
        if state.running.is_none() {
            return Err(EngineError::NotStarted);
        }
        Ok(TunnelFd(3))
    }

    fn wake(&self) -> bool {
        let mut state = self.state.lock();
        state.calls.wake += 1;
        Self::record(&mut state, "wake");
        let was_paused = state.paused;
        state.paused = false;
        was_paused
    }

    fn pause(&self) -> bool {
        let mut state = self.state.lock();
        state.calls.pause += 1;
        Self::record(&mut state, "pause");
        state.paused = true;
        state.last_paused_at = Some(Instant::now());
        true
    }

    fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    fn was_paused_recently(&self, window: Duration) -> bool {
        let state = self.state.lock();
        state.paused
            || state
                .last_paused_at
                .is_some_and(|at| at.elapsed() <= window)
    }

    async fn close_idle_connections(&self, _max_idle: Duration) -> usize {
        let mut state = self.state.lock();
        state.calls.close_idle += 1;
        Self::record(&mut state, "close_idle");
        std::mem::take(&mut state.idle_connections)
    }

    async fn close_all_tracked_connections(&self) -> usize {
        let mut state = self.state.lock();
        state.calls.close_all_tracked += 1;
        Self::record(&mut state, "close_all_tracked");
        std::mem::take(&mut state.tracked_connections)
    }

    async fn recover_network(&self, mode: RecoveryMode) -> bool {
        let mut state = self.state.lock();
        match mode {
            RecoveryMode::Quick => state.calls.recover_quick += 1,
            RecoveryMode::Full => state.calls.recover_full += 1,
            RecoveryMode::Deep => state.calls.recover_deep += 1,
            RecoveryMode::Proactive => state.calls.recover_proactive += 1,
            RecoveryMode::Auto => state.calls.recover_auto += 1,
        }
        Self::record(&mut state, &format!("recover_{}", mode));
        state.running.is_some()
    }

    async fn reset_all_connections(&self, _force: bool) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.calls.reset_all_connections += 1;
        Self::record(&mut state, "reset_all_connections");
        Ok(())
    }

    async fn reset_network(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.calls.reset_network += 1;
        Self::record(&mut state, "reset_network");
        if state.running.is_none() {
            return Err(EngineError::NotStarted);
        }
        Ok(())
    }

    async fn url_test_outbound(
        &self,
        _selected_tag: &str,
        _url: &str,
        _timeout: Duration,
    ) -> Option<u32> {
        let mut state = self.state.lock();
        state.calls.url_test += 1;
        Self::record(&mut state, "url_test");
        match state.probe_script.pop_front() {
            Some(result) => result,
            None => state.default_probe,
        }
    }

    async fn select_outbound(&self, _group_tag: &str, target_tag: &str) -> SwitchResult {
        let mut state = self.state.lock();
        state.calls.select_outbound += 1;
        Self::record(&mut state, "select_outbound");
        if !state.outbounds.iter().any(|o| o == target_tag) {
            return SwitchResult::Failed;
        }
        let result = state.select_result;
        if result == SwitchResult::Success {
            state.selected = Some(target_tag.to_string());
        }
        result
    }

    async fn hot_reload(&self, _config: &str) -> Result<bool, EngineError> {
        let mut state = self.state.lock();
        state.calls.hot_reload += 1;
        Self::record(&mut state, "hot_reload");
        state.hot_reload_result.clone()
    }

    fn set_underlying_network(&self, network: Option<&NetworkSnapshot>) {
        let mut state = self.state.lock();
        state.calls.set_underlying += 1;
        Self::record(&mut state, "set_underlying");
        state.underlying = network.cloned();
    }

    fn traffic_totals(&self) -> TrafficTotals {
        let mut state = self.state.lock();
        if state.traffic_flowing && state.running.is_some() {
            state.totals.tx_bytes += SIMULATED_BYTES_PER_READ;
            state.totals.rx_bytes += SIMULATED_BYTES_PER_READ;
        }
        state.totals
    }

    fn selected_outbound(&self) -> Option<String> {
        self.state.lock().selected.clone()
    }

    fn list_outbounds(&self) -> Vec<String> {
        self.state.lock().outbounds.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_and_close() {
        let engine = StubEngine::new();
        let handle = engine.start("{}").await.unwrap();
        assert!(engine.is_started());
        engine.close(handle).await.unwrap();
        assert!(!engine.is_started());
        assert_eq!(engine.calls().start, 1);
        assert_eq!(engine.calls().close, 1);
    }

    #[tokio::test]
    async fn test_start_failure_is_consumed() {
        let engine = StubEngine::new();
        engine.fail_next_start(EngineError::PermissionDenied("tun".into()));
        assert!(engine.start("{}").await.is_err());
        assert!(engine.start("{}").await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_script_then_default() {
        let engine = StubEngine::new();
        engine.script_probes([None, Some(10)]);
        engine.set_default_probe(None);
        let t = Duration::from_secs(1);
        assert_eq!(engine.url_test_outbound("p", "u", t).await, None);
        assert_eq!(engine.url_test_outbound("p", "u", t).await, Some(10));
        assert_eq!(engine.url_test_outbound("p", "u", t).await, None);
    }

    #[tokio::test]
    async fn test_select_unknown_outbound_fails() {
        let engine = StubEngine::new();
        assert_eq!(engine.select_outbound("select", "nope").await, SwitchResult::Failed);
        assert_eq!(engine.select_outbound("select", "proxy-b").await, SwitchResult::Success);
        assert_eq!(engine.selected_outbound().as_deref(), Some("proxy-b"));
    }

    #[tokio::test]
    async fn test_traffic_only_grows_while_running() {
        let engine = StubEngine::new();
        assert_eq!(engine.traffic_totals().total(), 0);
        let _handle = engine.start("{}").await.unwrap();
        let first = engine.traffic_totals().total();
        let second = engine.traffic_totals().total();
        assert!(second > first);
        engine.set_traffic_flowing(false);
        assert_eq!(engine.traffic_totals().total(), second);
    }
}
