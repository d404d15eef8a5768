// src/server/context.rs

use super::state::ServerState;
use crate::core::cache::MemoryCache;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Holds all the initialized state required to run the server's main loop.
pub struct ServerContext {
    pub state: Arc<ServerState>,
    /// The concrete backend behind `state.cache`, kept for the reaper task.
    pub memory_cache: Arc<MemoryCache>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
}
