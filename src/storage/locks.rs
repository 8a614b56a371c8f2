//! Path lock table
//!
//! Reference-counted reader/writer locks keyed by resolved path. An entry
//! exists only while at least one holder (or waiter) references it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

struct Entry {
    lock: Arc<RwLock<()>>,
    holders: usize,
}

/// Registry of per-path locks shared by every connection.
#[derive(Default)]
pub struct PathLockTable {
    entries: Mutex<HashMap<PathBuf, Entry>>,
}

impl PathLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `path` exclusively, waiting for current holders to release.
    pub async fn lock(self: &Arc<Self>, path: &Path) -> PathLockGuard {
        let reservation = Reservation::take(self, path);
        let held = Held::Exclusive(reservation.lock.clone().write_owned().await);
        PathLockGuard {
            held: Some(held),
            reservation,
        }
    }

    /// Acquires `path` shared, waiting for an exclusive holder to release.
    pub async fn rlock(self: &Arc<Self>, path: &Path) -> PathLockGuard {
        let reservation = Reservation::take(self, path);
        let held = Held::Shared(reservation.lock.clone().read_owned().await);
        PathLockGuard {
            held: Some(held),
            reservation,
        }
    }

    /// Number of paths currently tracked.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Holders and waiters currently referencing `path`.
    pub fn holders(&self, path: &Path) -> usize {
        self.entries
            .lock()
            .get(path)
            .map(|entry| entry.holders)
            .unwrap_or(0)
    }

    fn retain(&self, path: &Path) -> Arc<RwLock<()>> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(path.to_path_buf()).or_insert_with(|| Entry {
            lock: Arc::new(RwLock::new(())),
            holders: 0,
        });
        entry.holders += 1;
        Arc::clone(&entry.lock)
    }

    fn release(&self, path: &Path) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(path) {
            entry.holders -= 1;
            if entry.holders == 0 {
                entries.remove(path);
            }
        }
    }
}

/// Counted reference to a table entry; released on drop even if the lock
/// wait is cancelled.
struct Reservation {
    table: Arc<PathLockTable>,
    path: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl Reservation {
    fn take(table: &Arc<PathLockTable>, path: &Path) -> Self {
        let lock = table.retain(path);
        Self {
            table: Arc::clone(table),
            path: path.to_path_buf(),
            lock,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.table.release(&self.path);
    }
}

enum Held {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// A held path lock. Dropping it unlocks the path.
pub struct PathLockGuard {
    // Field order matters: the rwlock guard drops before the reservation.
    held: Option<Held>,
    reservation: Reservation,
}

impl PathLockGuard {
    pub fn path(&self) -> &Path {
        &self.reservation.path
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self.held, Some(Held::Exclusive(_)))
    }

    /// Releases the lock.
    pub fn unlock(mut self) {
        self.held.take();
    }
}

impl std::fmt::Debug for PathLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathLockGuard")
            .field("path", &self.reservation.path)
            .field("exclusive", &self.is_exclusive())
            .finish()
    }
}
