use std::net::SocketAddr;
use std::sync::Arc;

use keyforge::config::init_config;
use keyforge::errors::{ActivationError, ActivationResult};
use keyforge::server::{build_router, ActivationEngine, AppState, AuditRecorder, Database};
use keyforge::signer::Signer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("keyforge_server: {e}");
        std::process::exit(1);
    }
}

async fn run() -> ActivationResult<()> {
    let config = init_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase())),
        )
        .init();

    let db = Arc::new(Database::connect(&config.database).await?);
    db.migrate().await?;
    info!(db_type = db.db_type(), "Database ready");

    let signer = Signer::new(&config.signing.secret)?;
    let (audit, audit_worker) = AuditRecorder::spawn(Arc::clone(&db), config.audit.queue_capacity);
    let engine = ActivationEngine::new(Arc::clone(&db), signer, audit);

    let state = AppState::new(engine, &config.admin.api_key, config.listing.clone())
        .with_rate_limit(config.rate_limit.clone());
    if state.admin_key_hash.is_none() {
        warn!("admin.api_key is not set; administrative routes are disabled");
    }

    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ActivationError::Server(format!("failed to bind {addr}: {e}")))?;
    info!("Keyforge listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| ActivationError::Server(format!("server error: {e}")))?;

    info!("Draining audit queue");
    audit_worker.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
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
