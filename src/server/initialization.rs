// src/server/initialization.rs

//! Builds the cache, the per-origin engines and the listener before the
//! server starts accepting requests.

use super::context::ServerContext;
use super::state::ServerState;
use crate::config::Config;
use crate::core::cache::{Cache, MemoryCache};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Initializes all server components before starting the main loop.
pub async fn setup(config: Config) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let memory_cache = Arc::new(MemoryCache::new(config.cache.clone()));
    let cache: Arc<dyn Cache> = memory_cache.clone();

    let (host, port) = (config.host.clone(), config.port);
    let state = Arc::new(ServerState::new(config, cache)?);
    info!("Server state initialized.");

    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind {host}:{port}"))?;
    info!("Stride proxy listening on {}:{}", host, port);

    Ok(ServerContext {
        state,
        memory_cache,
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

fn log_startup_info(config: &Config) {
    for origin in &config.origins {
        info!(
            "Origin '{}' ({:?}) -> {}{}",
            origin.name,
            origin.origin_type,
            origin.origin_url,
            if origin.is_default { " [default]" } else { "" }
        );
    }
    if config.default_origin().is_none() {
        warn!("No default origin; only /<origin-name>/... paths will be served.");
    }
    info!(
        "Cache: compression={}, max object size {} bytes, timeseries TTL {:?}.",
        config.cache.compression, config.cache.max_object_size_bytes, config.cache.timeseries_ttl
    );
}
