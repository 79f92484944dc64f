// Error mapping from engine errors to HTTP responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use flowstate_engine::EngineError;
use serde::Serialize;
use utoipa::ToSchema;

/// JSON error body returned on every non-2xx response
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Wrapper that turns [`EngineError`] into an HTTP response
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self.0 {
            EngineError::WorkflowNotFound(_)
            | EngineError::VersionNotFound { .. }
            | EngineError::ExecutionNotFound(_)
            | EngineError::StepNotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            EngineError::DuplicateVersion { .. } => (StatusCode::CONFLICT, "DuplicateVersion"),
            EngineError::InvalidState { .. } => (StatusCode::CONFLICT, "InvalidState"),
            EngineError::Definition(_) => (StatusCode::BAD_REQUEST, "DefinitionError"),
            EngineError::Store(e) => {
                tracing::error!("store error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError")
            }
        };

        let body = ErrorBody {
            error: error.to_string(),
            message: self.0.to_string(),
            timestamp: Utc::now(),
        };
        (status, Json(body)).into_response()
    }
}

/// Bad request helper for malformed payloads handled before the engine
pub fn bad_request(message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: "BadRequest".to_string(),
        message: message.into(),
        timestamp: Utc::now(),
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}
