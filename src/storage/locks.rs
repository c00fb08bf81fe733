//! Keyed mutexes serializing modifying operations.
//!
//! Writers take the `path:` lock for the link they mutate and the `digest:`
//! lock for the blob they materialize or remove. Readers take no locks and
//! rely on the link database's transactional reads instead. Entries are
//! created on first use and dropped once the last holder or waiter is gone,
//! so the map stays bounded by the number of in-flight operations.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lock namespaces. Path and digest locks never contend with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockSpace {
    Path,
    Digest,
}

impl fmt::Display for LockSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockSpace::Path => write!(f, "path"),
            LockSpace::Digest => write!(f, "digest"),
        }
    }
}

#[derive(Default)]
struct Entry {
    lock: Arc<AsyncMutex<()>>,
    // Holders plus waiters; the entry is removed when this reaches zero.
    holders: usize,
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

/// An in-process keyed mutex with reference-counted entries.
#[derive(Clone, Default)]
pub struct LockMap {
    entries: Entries,
}

impl LockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the exclusive lock for `key` in `space`, waiting if another
    /// task holds it. The returned handle releases on drop. Cancelling the
    /// wait releases the entry reservation too.
    pub async fn acquire(&self, space: LockSpace, key: &str) -> LockHandle {
        let full_key = format!("{space}:{key}");
        let lock = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(full_key.clone()).or_default();
            entry.holders += 1;
            Arc::clone(&entry.lock)
        };
        let reservation = Reservation {
            entries: Arc::clone(&self.entries),
            key: full_key,
        };
        let guard = lock.lock_owned().await;
        LockHandle {
            _guard: guard,
            _reservation: reservation,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Counts one holder or waiter; releases the slot on drop whether or not
/// the lock was ever obtained.
struct Reservation {
    entries: Entries,
    key: String,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.holders -= 1;
            if entry.holders == 0 {
                entries.remove(&self.key);
            }
        }
    }
}

/// Exclusive hold on one key. Field order releases the mutex before the
/// reservation is returned.
pub struct LockHandle {
    _guard: OwnedMutexGuard<()>,
    _reservation: Reservation,
}
