// src/core/tasks/cache_reaper.rs

use crate::core::cache::MemoryCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// A task that periodically drops expired entries from the in-memory cache.
///
/// Reads already treat expired entries as misses; this keeps entries that are
/// never read again from holding memory.
pub struct CacheReaperTask {
    cache: Arc<MemoryCache>,
    interval: Duration,
}

impl CacheReaperTask {
    pub fn new(cache: Arc<MemoryCache>, interval: Duration) -> Self {
        Self { cache, interval }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Cache reaper task started. Check interval: {:?}",
            self.interval
        );
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let reaped = self.cache.reap();
                    if reaped > 0 {
                        debug!(
                            "Cache reaper: removed {} expired entries, {} remain.",
                            reaped,
                            self.cache.len()
                        );
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Cache reaper task shutting down.");
                    return;
                }
            }
        }
    }
}
