use anyhow::Result;
use axum::{extract::DefaultBodyLimit, routing::get, Router};
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::Config,
    db::Database,
    handlers,
    signals::setup_signal_handlers,
    telescope::{self, retention::spawn_retention_task, Telescope},
};

/// Start the server
///
/// This function:
/// 1. Opens the telescope store and the instrumented business database
/// 2. Starts the retention sweep
/// 3. Serves until SIGTERM/SIGINT, then flushes pending query captures
pub async fn start_server(config: Config) -> Result<()> {
    let (shutdown_tx, signal_handle) = setup_signal_handlers();
    let mut shutdown_rx = shutdown_tx.subscribe();

    let telescope = Telescope::new(config.telescope.clone()).await?;
    let db = Database::connect(&config.database.url, Some(telescope.queries().clone())).await?;

    let retention_handle = spawn_retention_task(
        telescope.store().clone(),
        config.telescope.retention_interval(),
    );

    let app = create_app(db, telescope.clone(), Router::new());

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    info!("Starting civic-telescope on {}", addr);
    info!(
        enabled = telescope.is_enabled(),
        dashboard = %config.telescope.dashboard_path,
        excluded = ?config.telescope.excluded_paths,
        "Telescope configured"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
        info!("Shutdown signal received, draining connections...");
    })
    .await?;

    signal_handle.await?;
    retention_handle.abort();

    info!("Flushing pending query captures...");
    telescope.flush().await;

    info!("Server stopped gracefully");

    Ok(())
}

/// Build the application router
///
/// `routes` are the business routes; they get the database as state by
/// the caller. Health endpoints and the telescope API are added here and
/// everything is wrapped in the capture stack.
pub fn create_app(db: Database, telescope: Arc<Telescope>, routes: Router) -> Router {
    let public = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .with_state(db);

    telescope::attach(public.merge(routes), telescope)
        // Security: Limit request body size to 10MB to prevent memory exhaustion attacks
        .layer(DefaultBodyLimit::max(telescope::capture::BODY_PARSE_LIMIT))
        .layer(TraceLayer::new_for_http())
}
