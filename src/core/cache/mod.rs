// src/core/cache/mod.rs

//! The pluggable key/bytes store behind both caching engines.

pub mod codec;
pub mod memory;

pub use codec::{query_cache, remove_document, write_cache};
pub use memory::MemoryCache;

use crate::config::CacheConfig;
use crate::core::errors::StrideError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// A key/bytes store with per-entry expiry.
///
/// Implementations must be safe to call concurrently from many tasks.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn store(&self, key: &str, data: Bytes, ttl: Duration) -> Result<(), StrideError>;

    /// Returns `StrideError::KeyNotFound` for absent or expired entries.
    async fn retrieve(&self, key: &str) -> Result<Bytes, StrideError>;

    async fn remove(&self, key: &str);

    fn configuration(&self) -> &CacheConfig;
}
