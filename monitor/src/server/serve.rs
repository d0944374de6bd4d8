//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::MonitorError;
use crate::server::handlers::{health_handler, status_handler, version_handler};
use crate::server::state::ServerState;

/// Routes of the status server
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/status", get(status_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), MonitorError>>, MonitorError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting status server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| MonitorError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| MonitorError::ServerError(e.to_string()))
    });

    Ok(handle)
}
