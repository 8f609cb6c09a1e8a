//! HTTP surface: task submission, per-client result streams, health.

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::stream::StreamConfig;

pub use error::{AppError, AppResult};

/// Shared state for every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<dyn Store>,
    pub stream: StreamConfig,
    /// Cancelled on shutdown; open result streams end with it.
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", post(handlers::submit_task))
        .route("/api/results", get(handlers::stream_results))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the state's shutdown token is cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let addr = listener
        .local_addr()
        .map_err(|e| Error::Other(format!("listener address: {e}")))?;
    tracing::info!("Starting server on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Other(format!("server error: {e}")))
}
