//! Rigsync Render Server
//!
//! Standalone host for the render core: loads models, runs the simulation
//! loop and closes every tracker cleanly on shutdown.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use rigsync::config::RenderConfig;
use rigsync::protocol::supported_revisions;
use rigsync::state::RenderContext;
use rigsync::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!(version = VERSION, "Rigsync render server starting");

    let config = RenderConfig::load().await?;
    info!(
        config = %config.config_path.display(),
        revision = config.protocol_revision,
        supported = ?supported_revisions(),
        "Configuration loaded"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let context = Arc::new(RenderContext::new(config, shutdown_tx.clone())?);

    // Initial model load runs on the blocking pool; the reload pool has its own threads
    let loader = context.clone();
    match tokio::task::spawn_blocking(move || loader.reload_models()).await {
        Ok(Ok(report)) => {
            if !report.failed.is_empty() {
                warn!(failed = report.failed.len(), "Some models failed to load");
            }
        }
        Ok(Err(e)) => warn!(error = %e, "Initial model load failed, starting with no models"),
        Err(e) => error!(error = %e, "Model load task failed"),
    }

    let world = context.world.clone();
    let mut world_shutdown_rx = shutdown_tx.subscribe();
    let world_handle = tokio::spawn(async move {
        world.run(&mut world_shutdown_rx).await;
    });

    info!(models = context.models.len(), "Server startup complete");

    wait_for_shutdown(shutdown_tx.clone()).await;

    info!("Shutting down server...");
    let _ = world_handle.await;
    let closed = context.shutdown();
    info!(closed, "Server shutdown complete");
    Ok(())
}

/// Initialize the logging/tracing system. `RIGSYNC_LOG_JSON=1` switches to JSON lines.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rigsync=debug"));
    let json = std::env::var("RIGSYNC_LOG_JSON").map_or(false, |v| v == "1" || v == "true");

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    let _ = shutdown_tx.send(());
}
