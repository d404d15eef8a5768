// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;

mod connection_loop;
mod context;
mod initialization;
mod metrics_server;
pub mod router;
mod spawner;
pub mod state;

pub use state::{OriginRuntime, ServerState};

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Build the cache, the origin engines and the listener.
    let mut server_context = initialization::setup(config).await?;

    // 2. Spawn the metrics server and cache maintenance.
    spawner::spawn_all(&mut server_context);

    // 3. Serve requests until shutdown.
    connection_loop::run(server_context).await
}
