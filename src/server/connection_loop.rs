// src/server/connection_loop.rs

//! Serves client requests until a signal or a failed background task asks
//! for shutdown, then stops everything gracefully.

use super::context::ServerContext;
use super::router;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Grace period for in-flight requests and background tasks on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The main server loop.
pub async fn run(ctx: ServerContext) -> Result<()> {
    let ServerContext {
        state,
        listener,
        shutdown_tx,
        mut background_tasks,
        ..
    } = ctx;

    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    let app = router::build(state);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            stop_rx.await.ok();
        })
        .await
    });

    let mut server_finished = false;
    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }

            res = &mut server => {
                server_finished = true;
                match res {
                    Ok(Ok(())) => warn!("HTTP server stopped unexpectedly."),
                    Ok(Err(e)) => error!("CRITICAL: HTTP server failed: {}. Shutting down.", e),
                    Err(e) => error!("CRITICAL: HTTP server task panicked: {:?}", e),
                }
                break;
            }

            Some(res) = background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {:?}. Shutting down.", e); break; }
                }
            }
        }
    }

    stop_tx.send(()).ok();
    if shutdown_tx.send(()).is_err() {
        warn!("No background task was listening for the shutdown signal.");
    }

    if !server_finished {
        info!("Waiting for in-flight requests to finish...");
        if tokio::time::timeout(SHUTDOWN_GRACE, server).await.is_err() {
            warn!("Timed out waiting for in-flight requests to finish.");
        }
    }

    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        while background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    };
    info!("Server shutdown complete.");
    Ok(())
}
