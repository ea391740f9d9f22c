use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod api;
mod rsync;
mod storage;
mod utils;

use crate::rsync::executor::check_rsync;
use crate::rsync::manager::ManagerOptions;
use crate::rsync::{RsyncExecutor, RsyncManager};
use crate::storage::{JsonFileStore, TaskStore};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init_tracing();

    let config = utils::config::load_config()?;

    info!("Starting rsync agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", config.data_dir.display());

    match check_rsync(&config.rsync_binary).await {
        Some((major, minor)) => info!("Found {} version {}.{}", config.rsync_binary, major, minor),
        None => warn!("Could not determine version of {}, transfers may fail", config.rsync_binary),
    }

    let store: Arc<dyn TaskStore> = Arc::new(JsonFileStore::open(config.storage_path())?);
    let executor = RsyncExecutor::new(config.rsync_binary.clone(), config.stop_grace);
    let manager = RsyncManager::new(
        store.clone(),
        Arc::new(executor),
        ManagerOptions {
            max_concurrency: config.max_concurrency,
            queue_size: config.queue_size,
            log_root: config.log_root(),
        },
    );

    let app = Router::new()
        .nest("/api/rsync", api::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(manager.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, manager.shutdown()).await.is_err() {
        warn!("Transfers still running after {:?}, exiting anyway", SHUTDOWN_TIMEOUT);
    }
    store.close()?;

    info!("Server stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
