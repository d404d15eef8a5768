// src/core/proxy/coalescer.rs

//! Per-key mutual exclusion ("single-flight by key").
//!
//! Every caching engine holds the guard for its cache key across the whole
//! read, reconcile and write sequence, so two requests for the same key never
//! reconcile concurrently. Entries are reference counted through the `Arc`
//! around each lock and evicted when the last holder or waiter lets go.

use crate::core::metrics::COALESCER_KEYS;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type LockMap = DashMap<String, Arc<Mutex<()>>>;

#[derive(Debug, Default)]
pub struct RequestCoalescer {
    locks: Arc<LockMap>,
}

impl RequestCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn acquire(&self, key: &str) -> CoalescerGuard {
        // The Arc is cloned while the shard lock is held, so a concurrent
        // release can never evict an entry somebody is about to wait on.
        let lock = Arc::clone(self.locks.entry(key.to_string()).or_default().value());
        COALESCER_KEYS.set(self.locks.len() as f64);

        let guard = lock.lock_owned().await;
        trace!("Coalescer acquired key '{}'", key);
        CoalescerGuard {
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one key. Dropping the guard releases it.
#[derive(Debug)]
pub struct CoalescerGuard {
    key: String,
    locks: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl CoalescerGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(self) {}
}

impl Drop for CoalescerGuard {
    fn drop(&mut self) {
        // Drop our own reference first so only the map's reference remains
        // when nobody else is holding or waiting.
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
        COALESCER_KEYS.set(self.locks.len() as f64);
        trace!("Coalescer released key '{}'", self.key);
    }
}
