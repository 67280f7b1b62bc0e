mod config;
mod error;
mod handlers;
mod router;
mod state;

use config::GatewayConfig;
use persistence::{JournalConfig, JournalStore};
use price_feed::{ConnectionRegistry, FeedMetrics, FileCalendar, ProducerHandle, ValueProducer};
use router::create_router;
use state::AppState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let config = GatewayConfig::from_env()?;
    info!(
        bind_addr = %config.bind_addr,
        calendar = %config.calendar_path.display(),
        journal = %config.journal_dir.display(),
        "Starting price feed gateway"
    );

    let journal = JournalConfig::new(&config.journal_dir);
    let store = Arc::new(tokio::task::spawn_blocking(move || JournalStore::open(journal)).await??);

    let registry = ConnectionRegistry::new(Arc::new(FeedMetrics::new()));
    let producer = ValueProducer::new(
        config.producer.clone(),
        Arc::new(FileCalendar::new(&config.calendar_path)),
        store.clone(),
        registry.clone(),
    )?
    .spawn();

    let app = create_router(AppState::new(registry.clone(), store.clone(), config.client_queue));

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("Listening on {}", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(producer, registry))
        .await?;

    store.sync()?;
    info!("Gateway stopped");
    Ok(())
}

/// Wait for a stop signal, then stop ticking and release every live socket so
/// the server can finish.
async fn shutdown(producer: ProducerHandle, registry: ConnectionRegistry) {
    wait_for_signal().await;
    info!("Shutdown signal received");

    if let Err(err) = producer.shutdown().await {
        error!(error = %err, "Producer task ended abnormally");
    }
    let closed = registry.clear();
    info!(closed, "Closed live connections");
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
