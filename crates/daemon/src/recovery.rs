//! Recovery coordinator
//!
//! One worker drains a FIFO queue of [`RecoveryRequest`]s, so the engine
//! never sees two repair actions at once. A request equal in action to one
//! still waiting is folded into it (reasons merged). The worker is spawned
//! on demand and exits when the queue is empty.
//!
//! Delayed follow-ups (post-recover verification, bump escalation) are
//! plain requests submitted later by a timer task bound to the
//! coordinator's cancellation token.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnelkeeper_core::{EngineError, RecoveryMode, RecoveryRequest};

use crate::config::RecoveryConfig;
use crate::Result;

/// Reasons that describe the device or app coming back to life.
const WAKE_KEYWORDS: &[&str] = &["device_idle_exit", "doze_exit", "screen_on", "app_foreground"];

/// Reasons exempt from the deep-recovery and bump cooldowns.
const COOLDOWN_EXEMPT_KEYWORDS: &[&str] = &["doze_exit", "app_foreground", "screen_on"];

const DOZE_KEYWORDS: &[&str] = &["doze_exit", "device_idle_exit"];

fn reason_has(reason: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| reason.contains(k))
}

/// Capabilities the coordinator needs from the lifecycle service.
#[async_trait]
pub trait RecoveryHooks: Send + Sync {
    fn is_running(&self) -> bool;

    fn is_stopping(&self) -> bool;

    fn is_manually_stopped(&self) -> bool;

    fn wake(&self) -> bool;

    fn pause(&self) -> bool;

    fn is_paused(&self) -> bool;

    fn was_paused_recently(&self, window: Duration) -> bool;

    async fn recover_network(&self, mode: RecoveryMode) -> bool;

    async fn reset_all_connections(&self) -> std::result::Result<(), EngineError>;

    async fn reset_network(&self) -> std::result::Result<(), EngineError>;

    async fn close_idle_connections(&self, max_idle: Duration) -> usize;

    async fn close_all_tracked_connections(&self) -> usize;

    /// Latency probe through the selected outbound; `None` on failure.
    async fn probe(&self, url: &str, timeout: Duration) -> Option<u32>;

    /// Re-propagate the last known physical network. False if none is known.
    fn reassert_network(&self) -> bool;

    /// Non-terminal stop, pause, start with the last config.
    async fn restart(&self, reason: &str) -> Result<()>;
}

/// Anything that accepts recovery requests. Lets detectors report
/// without holding the coordinator itself.
pub trait RecoveryRequester: Send + Sync {
    fn request(&self, request: RecoveryRequest);
}

impl RecoveryRequester for RecoveryCoordinator {
    fn request(&self, request: RecoveryRequest) {
        self.inner.submit(request);
    }
}

/// Which rung of the NetworkBump ladder ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpOutcome {
    Skipped,
    Healthy,
    SoftRecovered,
    QuickRecovered,
    FullRecovered,
    LastResort { network_reasserted: bool },
}

#[derive(Default)]
struct WorkQueue {
    items: VecDeque<RecoveryRequest>,
    worker_active: bool,
}

#[derive(Default)]
struct Marks {
    reset_connections: Option<Instant>,
    reset_core: Option<Instant>,
    restart: Option<Instant>,
    deep: Option<Instant>,
    bump: Option<Instant>,
    reset_failures: u32,
    last_reset_success: Option<Instant>,
}

fn within(mark: Option<Instant>, window: Duration) -> bool {
    mark.is_some_and(|at| at.elapsed() < window)
}

struct Inner {
    config: RecoveryConfig,
    hooks: Arc<dyn RecoveryHooks>,
    queue: Mutex<WorkQueue>,
    marks: Mutex<Marks>,
    idle: Notify,
    token: CancellationToken,
    executed: AtomicU64,
}

/// Cloneable handle to the coordinator.
#[derive(Clone)]
pub struct RecoveryCoordinator {
    inner: Arc<Inner>,
}

impl RecoveryCoordinator {
    pub fn new(config: RecoveryConfig, hooks: Arc<dyn RecoveryHooks>) -> Self {
        Self::with_token(config, hooks, CancellationToken::new())
    }

    /// Coordinator whose worker and timers stop when `token` is cancelled.
    pub fn with_token(
        config: RecoveryConfig,
        hooks: Arc<dyn RecoveryHooks>,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                hooks,
                queue: Mutex::new(WorkQueue::default()),
                marks: Mutex::new(Marks::default()),
                idle: Notify::new(),
                token,
                executed: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue a request. Must be called from within a tokio runtime.
    pub fn request(&self, request: RecoveryRequest) {
        self.inner.submit(request);
    }

    /// Number of requests waiting (not counting the one executing).
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().items.len()
    }

    pub fn executed_count(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// Drop queued work without cancelling the coordinator.
    pub fn clear(&self) {
        let dropped = {
            let mut queue = self.inner.queue.lock();
            let n = queue.items.len();
            queue.items.clear();
            n
        };
        if dropped > 0 {
            debug!("Dropped {} queued recovery requests", dropped);
        }
    }

    /// Cancel the worker and any delayed follow-ups. A restart already
    /// executing runs to completion; await [`wait_idle`](Self::wait_idle)
    /// to observe that.
    pub fn shutdown(&self) {
        self.inner.token.cancel();
        self.clear();
    }

    /// Resolves once the queue is empty and no request is executing.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let queue = self.inner.queue.lock();
                if !queue.worker_active && queue.items.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl Inner {
    fn submit(self: &Arc<Self>, request: RecoveryRequest) {
        if self.token.is_cancelled() {
            debug!("Coordinator shut down, ignoring {}", request.kind());
            return;
        }

        let start_worker = {
            let mut queue = self.queue.lock();
            let coalescable = !matches!(
                request,
                RecoveryRequest::ResetConnections { skip_debounce: true, .. }
            );
            if let Some(existing) = queue
                .items
                .iter_mut()
                .find(|queued| coalescable && queued.same_action(&request))
            {
                existing.merge_reason(request.reason());
                debug!("Coalesced {} into queued request: {}", request.kind(), existing.reason());
                return;
            }
            debug!("Queued {} ({})", request.kind(), request.reason());
            queue.items.push_back(request);
            if queue.worker_active {
                false
            } else {
                queue.worker_active = true;
                true
            }
        };

        if start_worker {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.run_worker().await });
        }
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            let next = {
                let mut queue = self.queue.lock();
                if self.token.is_cancelled() {
                    queue.items.clear();
                }
                match queue.items.pop_front() {
                    Some(request) => request,
                    None => {
                        queue.worker_active = false;
                        drop(queue);
                        self.idle.notify_waiters();
                        return;
                    }
                }
            };

            // A restart moves the lifecycle through STOPPING; dropping it
            // halfway would strand the service there with the engine open.
            if matches!(next, RecoveryRequest::Restart { .. }) {
                self.execute(next).await;
                continue;
            }

            tokio::select! {
                _ = self.token.cancelled() => {}
                _ = self.execute(next) => {}
            }
        }
    }

    fn schedule(self: &Arc<Self>, delay: Duration, request: RecoveryRequest) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.token.cancelled() => {}
                _ = tokio::time::sleep(delay) => inner.submit(request),
            }
        });
    }

    async fn execute(self: &Arc<Self>, request: RecoveryRequest) {
        let kind = request.kind();
        let reason = request.reason().to_string();

        if !self.hooks.is_running() || self.hooks.is_stopping() {
            info!("Skipping {} (reason: {}): tunnel not running", kind, reason);
            return;
        }

        let started = Instant::now();
        info!("Recovery {} started (reason: {})", kind, reason);

        match request {
            RecoveryRequest::Restart { reason } => self.restart(&reason).await,
            RecoveryRequest::ResetConnections { reason, skip_debounce } => {
                self.reset_connections(&reason, skip_debounce).await
            }
            RecoveryRequest::ResetCoreNetwork { reason, force } => {
                self.reset_core_network(&reason, force).await
            }
            RecoveryRequest::NetworkBump { reason } => {
                let outcome = self.network_bump(&reason).await;
                debug!("NetworkBump outcome: {:?}", outcome);
            }
            RecoveryRequest::Recover { mode, reason } => self.recover(mode, &reason).await,
            RecoveryRequest::EnterDeviceIdle { .. } => {
                let paused = self.hooks.pause();
                debug!("Engine pause returned {}", paused);
            }
            RecoveryRequest::CloseIdleConnections { max_idle, .. } => {
                let closed = self.hooks.close_idle_connections(max_idle).await;
                debug!("Closed {} idle connections", closed);
            }
            RecoveryRequest::VerifyConnectivity { reason, escalate_from } => {
                self.verify(&reason, escalate_from).await
            }
        }

        self.executed.fetch_add(1, Ordering::Relaxed);
        info!("Recovery {} finished in {:?} (reason: {})", kind, started.elapsed(), reason);
    }

    async fn restart(&self, reason: &str) {
        if self.hooks.is_manually_stopped() {
            info!("Restart suppressed: tunnel was stopped manually");
            return;
        }
        {
            let mut marks = self.marks.lock();
            if within(marks.restart, self.config.restart_cooldown) {
                warn!("Restart skipped: cooldown of {:?} not elapsed", self.config.restart_cooldown);
                return;
            }
            marks.restart = Some(Instant::now());
        }
        if let Err(e) = self.hooks.restart(reason).await {
            error!("Restart failed (reason: {}): {}", reason, e);
        }
    }

    async fn reset_connections(&self, reason: &str, skip_debounce: bool) {
        {
            let mut marks = self.marks.lock();
            if !skip_debounce
                && within(marks.reset_connections, self.config.reset_connections_debounce)
            {
                debug!("ResetConnections debounced (reason: {})", reason);
                return;
            }
            marks.reset_connections = Some(Instant::now());
        }
        if let Err(e) = self.hooks.reset_all_connections().await {
            warn!("Reset connections failed: {}", e);
        }
    }

    async fn reset_core_network(self: &Arc<Self>, reason: &str, force: bool) {
        let min_interval = if force {
            self.config.force_reset_min_interval
        } else {
            self.config.reset_core_network_debounce
        };

        {
            let mut marks = self.marks.lock();
            if within(marks.reset_core, min_interval) {
                debug!("ResetCoreNetwork debounced (reason: {})", reason);
                return;
            }
            let stale_success = marks
                .last_reset_success
                .is_some_and(|at| at.elapsed() > self.config.reset_failure_window);
            if marks.reset_failures >= self.config.reset_failure_threshold && stale_success {
                warn!(
                    "{} consecutive network reset failures, escalating to restart",
                    marks.reset_failures
                );
                marks.reset_failures = 0;
                drop(marks);
                self.submit(RecoveryRequest::restart("excessive network reset failures"));
                return;
            }
            marks.reset_core = Some(Instant::now());
        }

        if force {
            if let Err(e) = self.hooks.reset_all_connections().await {
                warn!("Reset connections before network reset failed: {}", e);
            }
            tokio::time::sleep(self.config.force_reset_grace).await;
        }

        match self.hooks.reset_network().await {
            Ok(()) => {
                let mut marks = self.marks.lock();
                marks.reset_failures = 0;
                marks.last_reset_success = Some(Instant::now());
            }
            Err(e) => {
                let failures = {
                    let mut marks = self.marks.lock();
                    marks.reset_failures += 1;
                    marks.reset_failures
                };
                warn!("Network reset failed ({} consecutive): {}", failures, e);
            }
        }
    }

    async fn probe(&self, timeout: Duration) -> bool {
        let url = self.config.probe_url.as_str();
        match tokio::time::timeout(timeout, self.hooks.probe(url, timeout)).await {
            Ok(Some(latency)) => {
                debug!("Probe ok: {}ms", latency);
                true
            }
            Ok(None) => {
                debug!("Probe failed");
                false
            }
            Err(_) => {
                debug!("Probe timed out after {:?}", timeout);
                false
            }
        }
    }

    async fn probe_after(&self, settle: Duration) -> bool {
        tokio::time::sleep(settle).await;
        self.probe(self.config.probe_timeout).await
    }

    async fn network_bump(self: &Arc<Self>, reason: &str) -> BumpOutcome {
        let cfg = &self.config;
        {
            let mut marks = self.marks.lock();
            if !reason_has(reason, COOLDOWN_EXEMPT_KEYWORDS)
                && within(marks.bump, cfg.network_bump_cooldown)
            {
                debug!("NetworkBump in cooldown (reason: {})", reason);
                return BumpOutcome::Skipped;
            }
            marks.bump = Some(Instant::now());
        }

        if reason_has(reason, WAKE_KEYWORDS) && self.hooks.is_paused() {
            self.hooks.wake();
            tokio::time::sleep(cfg.wake_settle).await;
        }

        if self.probe(cfg.probe_timeout).await {
            return BumpOutcome::Healthy;
        }

        let closed = self.hooks.close_idle_connections(cfg.soft_idle_threshold).await;
        debug!("Bump soft step closed {} idle connections", closed);
        if closed > 0 && self.probe_after(cfg.soft_settle).await {
            return BumpOutcome::SoftRecovered;
        }

        self.hooks.recover_network(RecoveryMode::Quick).await;
        if self.probe_after(cfg.medium_settle).await {
            return BumpOutcome::QuickRecovered;
        }

        if reason_has(reason, DOZE_KEYWORDS) || self.hooks.was_paused_recently(cfg.recently_paused_window)
        {
            self.hooks.recover_network(RecoveryMode::Full).await;
            if self.probe_after(cfg.hard_settle).await {
                return BumpOutcome::FullRecovered;
            }
        }

        let network_reasserted = self.hooks.reassert_network();
        let closed = self.hooks.close_all_tracked_connections().await;
        info!(
            "Bump last resort: closed {} tracked connections, network re-asserted: {}",
            closed, network_reasserted
        );
        if !network_reasserted {
            self.schedule(
                cfg.bump_escalation_delay,
                RecoveryRequest::recover(RecoveryMode::Full, reason),
            );
        }
        BumpOutcome::LastResort { network_reasserted }
    }

    async fn recover(self: &Arc<Self>, mode: RecoveryMode, reason: &str) {
        if mode == RecoveryMode::Deep {
            let mut marks = self.marks.lock();
            if !reason_has(reason, COOLDOWN_EXEMPT_KEYWORDS)
                && within(marks.deep, self.config.deep_recovery_cooldown)
            {
                debug!("Deep recovery in cooldown (reason: {})", reason);
                return;
            }
            marks.deep = Some(Instant::now());
        }

        let ok = self.hooks.recover_network(mode).await;
        debug!("recover_network({}) returned {}", mode, ok);

        if mode == RecoveryMode::Auto && reason.contains("app_foreground") {
            let closed = self
                .hooks
                .close_idle_connections(self.config.soft_idle_threshold)
                .await;
            debug!("Closed {} idle connections after foreground recovery", closed);
        }

        if self.config.verify_after_recover {
            self.schedule(
                self.config.verify_delay,
                RecoveryRequest::VerifyConnectivity {
                    reason: reason.to_string(),
                    escalate_from: Some(mode),
                },
            );
        }
    }

    async fn verify(self: &Arc<Self>, reason: &str, escalate_from: Option<RecoveryMode>) {
        if self.probe(self.config.verify_timeout).await {
            debug!("Connectivity verified");
            return;
        }
        match escalate_from {
            None => info!("Connectivity check failed (reason: {})", reason),
            Some(mode) => match mode.escalate() {
                Some(next) => {
                    info!("Connectivity not restored after {} recovery, escalating to {}", mode, next);
                    self.submit(RecoveryRequest::recover(next, reason));
                }
                None => {
                    warn!("Connectivity not restored after deep recovery, restarting");
                    self.submit(RecoveryRequest::restart(format!(
                        "recovery exhausted: {}",
                        reason
                    )));
                }
            },
        }
    }
}
