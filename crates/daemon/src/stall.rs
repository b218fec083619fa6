//! Traffic stall detection
//!
//! Cumulative byte counters are sampled once per `sample_interval`. Every
//! `check_interval` the total is compared with the previous checkpoint; a
//! delta below `min_bytes_delta` counts as a stalled window. Once
//! `min_stall_checkpoints` windows in a row stall, every further stalled
//! window emits [`StallEvent::Stalled`]. A healthy window resets the count
//! and emits [`StallEvent::Flowing`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tunnelkeeper_core::TrafficTotals;

use crate::config::StallConfig;

pub trait TrafficSource: Send + Sync {
    fn traffic_totals(&self) -> TrafficTotals;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSample {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub at: Instant,
}

impl TrafficSample {
    pub fn new(totals: TrafficTotals, at: Instant) -> Self {
        Self { tx_bytes: totals.tx_bytes, rx_bytes: totals.rx_bytes, at }
    }

    pub fn total(&self) -> u64 {
        self.tx_bytes.saturating_add(self.rx_bytes)
    }
}

/// Bytes per second over the last sample pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficRates {
    pub upload_bps: u64,
    pub download_bps: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallEvent {
    Stalled { consecutive_count: u32 },
    Flowing,
}

/// Pure stall bookkeeping, driven by [`observe`](Self::observe).
#[derive(Debug)]
pub struct StallTracker {
    check_interval: Duration,
    min_bytes_delta: u64,
    min_stall_checkpoints: u32,
    previous: Option<TrafficSample>,
    current: Option<TrafficSample>,
    checkpoint: Option<(Instant, u64)>,
    consecutive: u32,
}

impl StallTracker {
    pub fn new(config: &StallConfig) -> Self {
        Self {
            check_interval: config.check_interval,
            min_bytes_delta: config.min_bytes_delta,
            min_stall_checkpoints: config.min_stall_checkpoints.max(1),
            previous: None,
            current: None,
            checkpoint: None,
            consecutive: 0,
        }
    }

    pub fn observe(&mut self, sample: TrafficSample) -> Option<StallEvent> {
        self.previous = self.current.replace(sample);

        let Some((checked_at, checked_bytes)) = self.checkpoint else {
            self.checkpoint = Some((sample.at, sample.total()));
            return None;
        };
        if sample.at.duration_since(checked_at) < self.check_interval {
            return None;
        }

        let delta = sample.total().saturating_sub(checked_bytes);
        self.checkpoint = Some((sample.at, sample.total()));

        if delta < self.min_bytes_delta {
            self.consecutive += 1;
            debug!("Stalled window: {} bytes (count {})", delta, self.consecutive);
            (self.consecutive >= self.min_stall_checkpoints)
                .then_some(StallEvent::Stalled { consecutive_count: self.consecutive })
        } else {
            self.consecutive = 0;
            Some(StallEvent::Flowing)
        }
    }

    pub fn reset_stall_counter(&mut self) {
        self.consecutive = 0;
    }

    /// Drop the checkpoint so the next sample starts a fresh window.
    pub fn rebaseline(&mut self) {
        self.checkpoint = None;
        self.previous = None;
        self.current = None;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn rates(&self) -> TrafficRates {
        let (Some(prev), Some(cur)) = (self.previous, self.current) else {
            return TrafficRates::default();
        };
        let millis = cur.at.duration_since(prev.at).as_millis() as u64;
        if millis == 0 {
            return TrafficRates::default();
        }
        TrafficRates {
            upload_bps: cur.tx_bytes.saturating_sub(prev.tx_bytes) * 1000 / millis,
            download_bps: cur.rx_bytes.saturating_sub(prev.rx_bytes) * 1000 / millis,
        }
    }
}

/// Periodic sampler around a [`StallTracker`]. One instance per tunnel run.
pub struct TrafficStallDetector {
    sample_interval: Duration,
    source: Arc<dyn TrafficSource>,
    tracker: Mutex<StallTracker>,
    paused: AtomicBool,
}

impl TrafficStallDetector {
    pub fn new(config: &StallConfig, source: Arc<dyn TrafficSource>) -> Arc<Self> {
        Arc::new(Self {
            sample_interval: config.sample_interval,
            source,
            tracker: Mutex::new(StallTracker::new(config)),
            paused: AtomicBool::new(false),
        })
    }

    pub fn reset_stall_counter(&self) {
        self.tracker.lock().reset_stall_counter();
    }

    pub fn consecutive_stalls(&self) -> u32 {
        self.tracker.lock().consecutive()
    }

    pub fn rates(&self) -> TrafficRates {
        self.tracker.lock().rates()
    }

    /// Stop judging traffic, e.g. while the device is idle.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::Relaxed) {
            let mut tracker = self.tracker.lock();
            tracker.rebaseline();
            tracker.reset_stall_counter();
        }
    }

    pub fn sample_now(&self) -> Option<StallEvent> {
        if self.paused.load(Ordering::Relaxed) {
            return None;
        }
        let sample = TrafficSample::new(self.source.traffic_totals(), Instant::now());
        self.tracker.lock().observe(sample)
    }

    /// Sample until `token` is cancelled, forwarding events to `events`.
    pub fn spawn(
        self: &Arc<Self>,
        token: CancellationToken,
        events: mpsc::UnboundedSender<StallEvent>,
    ) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(detector.sample_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(event) = detector.sample_now() {
                            if let StallEvent::Stalled { consecutive_count } = event {
                                warn!("Traffic stall detected (consecutive windows: {})", consecutive_count);
                            }
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            debug!("Stall sampler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicU64;

    fn config() -> StallConfig {
        StallConfig::default()
    }

    /// Feed one 15s window ending with `delta` new bytes.
    fn window(tracker: &mut StallTracker, start: Instant, total: &mut u64, index: u32, delta: u64) -> Option<StallEvent> {
        *total += delta;
        let at = start + Duration::from_secs(15 * index as u64);
        tracker.observe(TrafficSample { tx_bytes: *total, rx_bytes: 0, at })
    }

    #[test]
    fn test_three_stalled_windows_fire_once_each() {
        let mut tracker = StallTracker::new(&config());
        let start = Instant::now();
        let mut total = 0;
        assert_eq!(window(&mut tracker, start, &mut total, 0, 0), None);

        assert_eq!(window(&mut tracker, start, &mut total, 1, 100), None);
        assert_eq!(window(&mut tracker, start, &mut total, 2, 100), None);
        assert_eq!(
            window(&mut tracker, start, &mut total, 3, 100),
            Some(StallEvent::Stalled { consecutive_count: 3 })
        );
        assert_eq!(
            window(&mut tracker, start, &mut total, 4, 0),
            Some(StallEvent::Stalled { consecutive_count: 4 })
        );
        assert_eq!(window(&mut tracker, start, &mut total, 5, 4096), Some(StallEvent::Flowing));
        assert_eq!(tracker.consecutive(), 0);
    }

    #[test]
    fn test_samples_inside_window_do_not_check() {
        let mut tracker = StallTracker::new(&config());
        let start = Instant::now();
        for s in 0..15 {
            let at = start + Duration::from_secs(s);
            assert_eq!(tracker.observe(TrafficSample { tx_bytes: 0, rx_bytes: 0, at }), None);
        }
        assert_eq!(tracker.consecutive(), 0);
    }

    #[test]
    fn test_reset_counter_restarts_episode() {
        let mut tracker = StallTracker::new(&config());
        let start = Instant::now();
        let mut total = 0;
        window(&mut tracker, start, &mut total, 0, 0);
        for i in 1..=3 {
            window(&mut tracker, start, &mut total, i, 0);
        }
        tracker.reset_stall_counter();
        assert_eq!(window(&mut tracker, start, &mut total, 4, 0), None);
        assert_eq!(tracker.consecutive(), 1);
    }

    #[test]
    fn test_rates_from_last_pair() {
        let mut tracker = StallTracker::new(&config());
        let start = Instant::now();
        tracker.observe(TrafficSample { tx_bytes: 0, rx_bytes: 0, at: start });
        tracker.observe(TrafficSample {
            tx_bytes: 2000,
            rx_bytes: 8000,
            at: start + Duration::from_secs(2),
        });
        assert_eq!(tracker.rates(), TrafficRates { upload_bps: 1000, download_bps: 4000 });
    }

    proptest! {
        #[test]
        fn prop_counter_matches_model(deltas in proptest::collection::vec(0u64..4096, 1..40)) {
            let mut tracker = StallTracker::new(&config());
            let start = Instant::now();
            let mut total = 0;
            window(&mut tracker, start, &mut total, 0, 0);

            let mut expected = 0u32;
            for (i, delta) in deltas.iter().enumerate() {
                let event = window(&mut tracker, start, &mut total, i as u32 + 1, *delta);
                if *delta < 1024 {
                    expected += 1;
                    if expected >= 3 {
                        prop_assert_eq!(event, Some(StallEvent::Stalled { consecutive_count: expected }));
                    } else {
                        prop_assert_eq!(event, None);
                    }
                } else {
                    expected = 0;
                    prop_assert_eq!(event, Some(StallEvent::Flowing));
                }
                prop_assert_eq!(tracker.consecutive(), expected);
            }
        }
    }

    struct FrozenCounter(AtomicU64);

    impl TrafficSource for FrozenCounter {
        fn traffic_totals(&self) -> TrafficTotals {
            TrafficTotals { tx_bytes: self.0.load(Ordering::Relaxed), rx_bytes: 0 }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_emits_stall_and_stops_on_cancel() {
        let detector = TrafficStallDetector::new(&config(), Arc::new(FrozenCounter(AtomicU64::new(0))));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = detector.spawn(token.clone(), tx);

        let event = tokio::time::timeout(Duration::from_secs(60), rx.recv()).await.unwrap();
        assert_eq!(event, Some(StallEvent::Stalled { consecutive_count: 3 }));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_detector_ignores_samples() {
        let detector = TrafficStallDetector::new(&config(), Arc::new(FrozenCounter(AtomicU64::new(0))));
        detector.pause();
        assert_eq!(detector.sample_now(), None);
        detector.resume();
        assert_eq!(detector.sample_now(), None);
        assert_eq!(detector.consecutive_stalls(), 0);
    }
}
