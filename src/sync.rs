//! Per-key serialization for inbound processing.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A map of named async mutexes.
///
/// All inbound work for one phone number runs under that number's mutex, so
/// two webhooks from the same sender process strictly one after the other
/// (tokio mutexes are fair: waiters acquire in arrival order) while traffic
/// from different numbers proceeds in parallel.
#[derive(Debug, Default)]
pub struct KeyedMutex {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the mutex for `key`, creating it on first use.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop mutexes nobody is holding or waiting on. Called periodically so
    /// the map does not grow with every phone number ever seen.
    pub fn sweep(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
