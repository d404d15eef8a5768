// src/core/cache/memory.rs

use super::Cache;
use crate::config::CacheConfig;
use crate::core::errors::StrideError;
use crate::core::metrics::CACHE_OPERATIONS_TOTAL;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Ceiling applied to TTLs whose expiry would overflow `Instant`.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    expires_at: Instant,
}

/// An in-process cache backend. Expired entries are hidden on read and
/// removed by the reaper task.
#[derive(Debug)]
pub struct MemoryCache {
    config: CacheConfig,
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn reap(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn store(&self, key: &str, data: Bytes, ttl: Duration) -> Result<(), StrideError> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .or_else(|| now.checked_add(MAX_TTL))
            .unwrap_or(now);
        self.entries
            .insert(key.to_string(), Entry { data, expires_at });
        CACHE_OPERATIONS_TOTAL
            .with_label_values(&["store", "ok"])
            .inc();
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Bytes, StrideError> {
        let found = self
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.data.clone());
        match found {
            Some(data) => {
                CACHE_OPERATIONS_TOTAL
                    .with_label_values(&["retrieve", "hit"])
                    .inc();
                Ok(data)
            }
            None => {
                CACHE_OPERATIONS_TOTAL
                    .with_label_values(&["retrieve", "miss"])
                    .inc();
                Err(StrideError::KeyNotFound)
            }
        }
    }

    async fn remove(&self, key: &str) {
        self.entries.remove(key);
        CACHE_OPERATIONS_TOTAL
            .with_label_values(&["remove", "ok"])
            .inc();
    }

    fn configuration(&self) -> &CacheConfig {
        &self.config
    }
}
