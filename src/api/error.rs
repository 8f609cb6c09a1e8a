use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::Error;

/// Error returned by HTTP handlers. Renders as `{error, code}` JSON.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] Error),

    /// The request body or query could not be parsed.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Core(core) => match core {
                Error::Validation { .. } => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", core.to_string())
                }
                Error::MissingClientId => {
                    (StatusCode::BAD_REQUEST, "MISSING_CLIENT_ID", core.to_string())
                }
                Error::DuplicateTask(_) => (StatusCode::CONFLICT, "CONFLICT", core.to_string()),
                Error::StoreUnavailable(msg) => {
                    tracing::error!(error = %msg, "store unavailable");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "STORE_UNAVAILABLE",
                        "Task store is unavailable, try again later".to_string(),
                    )
                }
                Error::Serialization(_) | Error::Config(_) | Error::Other(_) => {
                    tracing::error!(error = %core, "internal error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
