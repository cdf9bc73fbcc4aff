use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get, routing::post};
use tokio::net::TcpListener;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{services, state::AppState};
use crate::config::Config;
use crate::engine::Engine;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Operator API routes
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(services::health))
        .route("/metrics", get(services::metrics))
        .route("/jobs", post(services::submit_job).get(services::list_jobs))
        .route("/jobs/stats", get(services::job_stats))
        .route(
            "/jobs/{job_id}",
            get(services::get_job).delete(services::cancel_job),
        )
        .route("/breakers", get(services::list_breakers))
        .route("/breakers/{name}/reset", post(services::reset_breaker))
        .route("/cache/stats", get(services::cache_stats))
        .route("/scheduler/tasks", get(services::scheduler_tasks))
        .with_state(state)
        // gzip request bodies are decoded before the handlers see them
        .layer(RequestDecompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Build the engine, serve the API until a shutdown signal, then stop the
/// engine (scheduler first, then a bounded drain of the queue)
pub async fn run(config: Config, address: Option<SocketAddr>) -> Result<(), AnyError> {
    let address = address.unwrap_or(config.server.bind_addr);

    let engine = Arc::new(
        Engine::new(config)
            .await
            .map_err(|e| format!("Failed to build engine: {e}"))?,
    );
    engine.start();

    let app = router(AppState::new(engine.clone()));

    let listener = TcpListener::bind(address).await?;
    info!(%address, "Bulwark API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let report = engine.stop().await;
    if !report.abandoned.is_empty() {
        tracing::warn!(
            abandoned = report.abandoned.len(),
            "Jobs were abandoned at shutdown and must be resubmitted"
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
