use std::convert::Infallible;

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::AppState;
use super::error::{AppError, AppResult};
use crate::dispatch::SubmitRequest;
use crate::model::TaskId;
use crate::stream::ClientStreamSession;

/// Frames buffered between a session and a slow client before the session
/// waits on it.
const FRAME_BUFFER: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    pub task_id: TaskId,
    pub message: String,
}

/// POST /api/tasks
pub async fn submit_task(
    State(state): State<AppState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> AppResult<Json<SubmitResponse>> {
    let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let task = state.dispatcher.submit(request).await?;

    Ok(Json(SubmitResponse {
        success: true,
        message: format!("Task sent to {} worker", task.language),
        task_id: task.task_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
}

/// GET /api/results?clientId=...
///
/// The session subscribes before the response starts, so a missing client id
/// or an unreachable store is an ordinary error response. Once streaming, the
/// session runs on its own task and ends when the client drops the body or
/// the server shuts down.
pub async fn stream_results(
    State(state): State<AppState>,
    Query(query): Query<ResultsQuery>,
) -> AppResult<Response> {
    let session = ClientStreamSession::open(
        state.store.as_ref(),
        query.client_id.as_deref(),
        &state.stream,
    )
    .await?;

    let (mut tx, rx) = mpsc::channel::<String>(FRAME_BUFFER);
    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        session.run(&mut tx, cancel).await;
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".to_string(),
                store: "ok".to_string(),
            }),
        ),
        Err(e) => {
            tracing::warn!("health check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded".to_string(),
                    store: "unavailable".to_string(),
                }),
            )
        }
    }
}
