//! Durable cross-process tunnel state
//!
//! A single JSON document under the state directory. Writers take an
//! exclusive lock on a sidecar `.lock` file, read the current document,
//! apply their change, write a temp file in the same directory and rename
//! it over the original, so readers in any process see either the old or
//! the new document and never a torn write. Readers take a shared lock.
//!
//! The daemon mirrors every state transition here; clients fall back to it
//! when the daemon's socket is unreachable.

mod paths;

pub use paths::{default_state_dir, expand_path};

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use tunnelkeeper_core::{CoreMode, ServiceState, StateSnapshot};

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to persist state file: {0}")]
    Persist(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Values shared between the daemon and observer processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableState {
    pub active: bool,
    /// "starting", "stopping" or empty
    pub pending: String,
    pub active_label: String,
    pub last_error: String,
    pub manually_stopped: bool,
    pub mode: CoreMode,
    /// Wall-clock millis of the last accepted prepare-restart
    pub last_prepare_restart_at_ms: u64,
}

impl DurableState {
    /// Best-effort reconstruction of a snapshot for observers that cannot
    /// reach the daemon.
    pub fn to_snapshot(&self) -> StateSnapshot {
        let state = match self.pending.as_str() {
            "starting" => ServiceState::Starting,
            "stopping" => ServiceState::Stopping,
            _ if self.active => ServiceState::Running,
            _ => ServiceState::Stopped,
        };
        StateSnapshot {
            state,
            active_label: self.active_label.clone(),
            last_error: self.last_error.clone(),
            manually_stopped: self.manually_stopped,
            version: 0,
        }
    }
}

/// Handle to the state document. Cheap to clone; holds no open files.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    path: PathBuf,
    lock_path: PathBuf,
}

impl StateStore {
    /// Open (creating the directory if needed) the store under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = expand_path(dir.as_ref());
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join(STATE_FILE),
            lock_path: dir.join(LOCK_FILE),
            dir,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)?)
    }

    fn read_unlocked(&self) -> Result<DurableState> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(DurableState::default()),
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => Ok(state),
                Err(e) => {
                    warn!("Discarding unreadable state file {:?}: {}", self.path, e);
                    Ok(DurableState::default())
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(DurableState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_unlocked(&self, state: &DurableState) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut tmp, state)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::Persist(e.error.to_string()))?;
        Ok(())
    }

    /// Read the current document under a shared lock.
    pub fn load(&self) -> Result<DurableState> {
        let lock = self.lock_file()?;
        lock.lock_shared()?;
        let state = self.read_unlocked();
        lock.unlock()?;
        state
    }

    /// Atomic read-modify-write under the exclusive lock. Skips the write
    /// when the closure leaves the document unchanged.
    pub fn update<F>(&self, f: F) -> Result<DurableState>
    where
        F: FnOnce(&mut DurableState),
    {
        let lock = self.lock_file()?;
        lock.lock()?;
        let result = (|| -> Result<DurableState> {
            let before = self.read_unlocked()?;
            let mut after = before.clone();
            f(&mut after);
            if after != before {
                self.write_unlocked(&after)?;
                debug!("State store updated: {:?}", after);
            }
            Ok(after)
        })();
        lock.unlock()?;
        result
    }

    pub fn set_active(&self, active: bool) -> Result<()> {
        self.update(|s| s.active = active).map(|_| ())
    }

    pub fn set_pending(&self, pending: &str) -> Result<()> {
        self.update(|s| s.pending = pending.to_string()).map(|_| ())
    }

    pub fn set_active_label(&self, label: &str) -> Result<()> {
        self.update(|s| s.active_label = label.to_string()).map(|_| ())
    }

    pub fn set_last_error(&self, error: &str) -> Result<()> {
        self.update(|s| s.last_error = error.to_string()).map(|_| ())
    }

    pub fn set_manually_stopped(&self, value: bool) -> Result<()> {
        self.update(|s| s.manually_stopped = value).map(|_| ())
    }

    pub fn set_mode(&self, mode: CoreMode) -> Result<()> {
        self.update(|s| s.mode = mode).map(|_| ())
    }

    pub fn is_manually_stopped(&self) -> Result<bool> {
        Ok(self.load()?.manually_stopped)
    }

    /// Cross-process throttle: returns true and records the time if no
    /// prepare-restart was accepted within `min_interval`.
    pub fn should_trigger_prepare_restart(&self, min_interval: Duration) -> Result<bool> {
        let now = now_millis();
        let min = min_interval.as_millis() as u64;
        let mut accepted = false;
        self.update(|s| {
            if now.saturating_sub(s.last_prepare_restart_at_ms) >= min {
                s.last_prepare_restart_at_ms = now;
                accepted = true;
            }
        })?;
        Ok(accepted)
    }

    /// Reset every field except the durable manual-stop flag.
    pub fn clear_runtime(&self) -> Result<()> {
        self.update(|s| {
            let manually_stopped = s.manually_stopped;
            *s = DurableState { manually_stopped, ..DurableState::default() };
        })
        .map(|_| ())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_missing_file_loads_default() {
        let (_dir, store) = store();
        assert_eq!(store.load().unwrap(), DurableState::default());
    }

    #[test]
    fn test_update_persists_across_handles() {
        let (dir, store) = store();
        store.set_active(true).unwrap();
        store.set_active_label("sg-1").unwrap();
        store.set_mode(CoreMode::Tunnel).unwrap();

        let other = StateStore::open(dir.path()).unwrap();
        let state = other.load().unwrap();
        assert!(state.active);
        assert_eq!(state.active_label, "sg-1");
        assert_eq!(state.mode, CoreMode::Tunnel);
    }

    #[test]
    fn test_corrupt_file_is_discarded() {
        let (_dir, store) = store();
        fs::write(store.path(), b"{not json").unwrap();
        assert_eq!(store.load().unwrap(), DurableState::default());
        store.set_manually_stopped(true).unwrap();
        assert!(store.is_manually_stopped().unwrap());
    }

    #[test]
    fn test_prepare_restart_throttle() {
        let (_dir, store) = store();
        let window = Duration::from_secs(60);
        assert!(store.should_trigger_prepare_restart(window).unwrap());
        assert!(!store.should_trigger_prepare_restart(window).unwrap());
        assert!(store.should_trigger_prepare_restart(Duration::ZERO).unwrap());
    }

    #[test]
    fn test_clear_runtime_keeps_manual_stop() {
        let (_dir, store) = store();
        store
            .update(|s| {
                s.active = true;
                s.manually_stopped = true;
                s.last_error = "boom".into();
            })
            .unwrap();
        store.clear_runtime().unwrap();
        let state = store.load().unwrap();
        assert!(!state.active);
        assert!(state.manually_stopped);
        assert!(state.last_error.is_empty());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let (dir, _store) = store();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    let store = StateStore::open(&path).unwrap();
                    for _ in 0..10 {
                        store
                            .update(|s| {
                                let n: u64 = s.pending.parse().unwrap_or(0);
                                s.pending = (n + 1).to_string();
                            })
                            .unwrap();
                    }
                    i
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.load().unwrap().pending, "80");
    }

    #[test]
    fn test_snapshot_reconstruction() {
        let state = DurableState {
            active: true,
            active_label: "us-3".into(),
            ..Default::default()
        };
        assert_eq!(state.to_snapshot().state, ServiceState::Running);

        let state = DurableState { pending: "stopping".into(), active: true, ..Default::default() };
        assert_eq!(state.to_snapshot().state, ServiceState::Stopping);
    }
}
