use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use relay_rs::config::Settings;
use relay_rs::orchestrator::RelayOrchestrator;
use relay_rs::storage::memory::MemoryStore;
use relay_rs::storage::Storage;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::parse();

    if settings.storage_backend != "memory" {
        error!(
            backend = %settings.storage_backend,
            "unsupported storage backend; this build only ships the in-memory backend"
        );
        std::process::exit(1);
    }

    let store: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let orchestrator = Arc::new(RelayOrchestrator::new(store, settings.clone()));

    let listener = match tokio::net::TcpListener::bind(settings.listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %settings.listen_addr, error = %err, "failed to bind listen address");
            std::process::exit(1);
        }
    };

    info!(addr = %settings.listen_addr, "relay-rs listening");

    let app = relay_rs::http::router(orchestrator.clone())
        .into_make_service_with_connect_info::<std::net::SocketAddr>();

    let shutdown_orchestrator = orchestrator.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        shutdown_orchestrator.shutdown_gracefully().await;
    });

    if let Err(err) = server.await {
        error!(error = %err, "server exited with an error");
        std::process::exit(1);
    }

    info!("relay-rs shut down cleanly");
}

/// Waits for ctrl-c or, on unix, SIGTERM (spec §5: orchestrator shutdown
/// sets a process-wide cancellation observed at each session's next
/// suspension point).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
