//! State broadcast hub
//!
//! `update` merges a patch into the current snapshot under the snapshot
//! lock and either starts a drain task or, if one is already running,
//! marks the hub pending. The drain task loops until nothing is pending:
//!
//! ```text
//! lock → clear pending → clone snapshot → unlock → deliver → lock → pending? repeat : exit
//! ```
//!
//! At most one drain runs per hub. The subscriber registry has its own
//! lock. Every entry remembers the last version it received so that a
//! registration racing an in-flight drain never sees an older snapshot
//! after a newer one.
//!
//! With a durable store attached, the drain also writes each snapshot it
//! picks up to the store, outside both locks and on the blocking pool.
//! Writes therefore land in version order and intermediate versions may be
//! skipped. [`StateHub::flushed`] waits for the drain to finish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use tunnelkeeper_core::{CoreMode, ServiceState, SnapshotPatch, StateSnapshot};
use tunnelkeeper_store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

#[derive(Debug, Error)]
pub enum SubscriberError {
    /// The subscriber's peer is gone; the entry is dropped.
    #[error("subscriber gone")]
    Gone,

    /// A single delivery failed; the entry stays registered.
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Receives snapshots. Called from the drain task and, once, from
/// `register`; implementations must not block.
pub trait StateSubscriber: Send + Sync {
    fn on_state_changed(&self, snapshot: &StateSnapshot) -> Result<(), SubscriberError>;
}

/// Snapshots a [`ChannelSubscriber`] buffers before deliveries fail.
pub const SUBSCRIBER_QUEUE: usize = 32;

/// Forwards snapshots into a bounded channel. A closed receiver reports
/// [`SubscriberError::Gone`]; a full one reports
/// [`SubscriberError::Failed`], leaving the entry's version untouched so
/// the next drain hands it the latest snapshot instead of a backlog.
pub struct ChannelSubscriber {
    tx: mpsc::Sender<StateSnapshot>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, mpsc::Receiver<StateSnapshot>) {
        Self::with_capacity(SUBSCRIBER_QUEUE)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<StateSnapshot>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl StateSubscriber for ChannelSubscriber {
    fn on_state_changed(&self, snapshot: &StateSnapshot) -> Result<(), SubscriberError> {
        self.tx.try_send(snapshot.clone()).map_err(|e| match e {
            TrySendError::Closed(_) => SubscriberError::Gone,
            TrySendError::Full(_) => SubscriberError::Failed("queue full".to_string()),
        })
    }
}

struct Entry {
    id: SubscriberId,
    subscriber: Arc<dyn StateSubscriber>,
    last_version: Option<u64>,
}

struct Current {
    snapshot: StateSnapshot,
    broadcasting: bool,
    pending: bool,
}

pub struct StateHub {
    current: Mutex<Current>,
    registry: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    drains: AtomicU64,
    idle: Notify,
    store: Option<StateStore>,
}

impl StateHub {
    pub fn new(initial: StateSnapshot) -> Arc<Self> {
        Self::build(initial, None)
    }

    /// Hub that mirrors every applied patch into the durable store.
    pub fn with_store(initial: StateSnapshot, store: StateStore) -> Arc<Self> {
        Self::build(initial, Some(store))
    }

    fn build(initial: StateSnapshot, store: Option<StateStore>) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(Current {
                snapshot: initial,
                broadcasting: false,
                pending: false,
            }),
            registry: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            drains: AtomicU64::new(0),
            idle: Notify::new(),
            store,
        })
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.current.lock().snapshot.clone()
    }

    /// Number of drain bursts started so far.
    pub fn drain_count(&self) -> u64 {
        self.drains.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Merge `patch` and schedule delivery. Never waits for subscribers.
    pub fn update(self: &Arc<Self>, patch: SnapshotPatch) -> StateSnapshot {
        if patch.is_empty() {
            return self.snapshot();
        }

        let (snapshot, start_drain) = {
            let mut current = self.current.lock();
            let next = current.snapshot.apply(&patch);
            current.snapshot = next.clone();
            if current.broadcasting {
                current.pending = true;
                (next, false)
            } else {
                current.broadcasting = true;
                (next, true)
            }
        };

        debug!(
            "Hub update v{}: state={} label={:?} error={:?} manual={}",
            snapshot.version,
            snapshot.state,
            snapshot.active_label,
            snapshot.last_error,
            snapshot.manually_stopped
        );

        if start_drain {
            self.drains.fetch_add(1, Ordering::Relaxed);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let hub = Arc::clone(self);
                    if self.store.is_some() {
                        handle.spawn_blocking(move || hub.drain());
                    } else {
                        handle.spawn(async move { hub.drain() });
                    }
                }
                Err(_) => self.drain(),
            }
        }

        snapshot
    }

    fn drain(&self) {
        loop {
            let snapshot = {
                let mut current = self.current.lock();
                current.pending = false;
                current.snapshot.clone()
            };

            self.deliver(&snapshot);
            self.mirror(&snapshot);

            let mut current = self.current.lock();
            if !current.pending {
                current.broadcasting = false;
                break;
            }
        }
        self.idle.notify_waiters();
    }

    /// Resolves once no drain is running, so every applied patch has been
    /// delivered and written to the store.
    pub async fn flushed(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.current.lock().broadcasting {
                return;
            }
            notified.await;
        }
    }

    fn deliver(&self, snapshot: &StateSnapshot) {
        let mut registry = self.registry.lock();
        registry.retain_mut(|entry| {
            if entry.last_version.is_some_and(|v| v >= snapshot.version) {
                return true;
            }
            match entry.subscriber.on_state_changed(snapshot) {
                Ok(()) => {
                    entry.last_version = Some(snapshot.version);
                    true
                }
                Err(SubscriberError::Gone) => {
                    debug!("Dropping dead subscriber {:?}", entry.id);
                    false
                }
                Err(e) => {
                    warn!("Delivery to subscriber {:?} failed: {}", entry.id, e);
                    true
                }
            }
        });
    }

    /// Register a subscriber. The current snapshot is delivered before
    /// this returns.
    pub fn register(&self, subscriber: Arc<dyn StateSubscriber>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.registry.lock();
        let snapshot = self.snapshot();

        let last_version = match subscriber.on_state_changed(&snapshot) {
            Ok(()) => Some(snapshot.version),
            Err(SubscriberError::Gone) => {
                debug!("Subscriber {:?} gone during registration", id);
                return id;
            }
            Err(e) => {
                warn!("Initial delivery to subscriber {:?} failed: {}", id, e);
                None
            }
        };

        registry.push(Entry { id, subscriber, last_version });
        debug!("Registered subscriber {:?} ({} total)", id, registry.len());
        id
    }

    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.len();
        registry.retain(|entry| entry.id != id);
        before != registry.len()
    }

    /// Register a [`ChannelSubscriber`] and hand back its receiver.
    pub fn subscribe_channel(&self) -> (SubscriberId, mpsc::Receiver<StateSnapshot>) {
        let (subscriber, rx) = ChannelSubscriber::new();
        let id = self.register(Arc::new(subscriber));
        (id, rx)
    }

    fn mirror(&self, snapshot: &StateSnapshot) {
        let Some(store) = &self.store else {
            return;
        };
        let result = store.update(|durable| {
            durable.active = snapshot.state == ServiceState::Running;
            durable.pending = match snapshot.state {
                ServiceState::Starting => "starting".to_string(),
                ServiceState::Stopping => "stopping".to_string(),
                _ => String::new(),
            };
            match snapshot.state {
                ServiceState::Running => durable.mode = CoreMode::Tunnel,
                ServiceState::Stopped => durable.mode = CoreMode::None,
                _ => {}
            }
            durable.active_label = snapshot.active_label.clone();
            durable.last_error = snapshot.last_error.clone();
            durable.manually_stopped = snapshot.manually_stopped;
        });
        if let Err(e) = result {
            warn!("Failed to mirror state to store: {}", e);
        }
    }
}
