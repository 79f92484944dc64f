// Execution lifecycle routes

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use flowstate_engine::service::{ExecutionView, HistoryView, StartOutcome, StepView};
use flowstate_engine::store::ExecutionFilter;

use crate::error::{bad_request, ApiError};
use crate::AppState;

/// Request to start an execution
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionRequest {
    pub workflow_name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_input")]
    pub input: Value,
}

fn default_input() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Query parameters for listing executions
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListExecutionsParams {
    /// Comma-separated status filter, e.g. `RUNNING,FAILED`
    #[serde(default)]
    pub statuses: Option<String>,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub started_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_before: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/executions", get(list_executions).post(start_execution))
        .route("/v1/executions/:execution_id", get(get_execution))
        .route(
            "/v1/executions/:execution_id/steps/:step_id",
            get(get_execution_step),
        )
        .route(
            "/v1/executions/:execution_id/history",
            get(get_execution_history),
        )
        .route("/v1/executions/:execution_id/cancel", post(cancel_execution))
        .with_state(state)
}

/// POST /v1/executions - Start a workflow execution
///
/// An `Idempotency-Key` header makes the start request replay-safe: a repeat
/// within the key's TTL returns the original execution with status 200
/// instead of creating a second one.
#[utoipa::path(
    post,
    path = "/v1/executions",
    request_body = StartExecutionRequest,
    params(
        ("Idempotency-Key" = Option<String>, Header, description = "Deduplication key for the start request")
    ),
    responses(
        (status = 201, description = "Execution started", body = ExecutionView),
        (status = 200, description = "Existing execution returned for the idempotency key", body = ExecutionView),
        (status = 404, description = "Unknown workflow or version")
    ),
    tag = "executions"
)]
pub async fn start_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StartExecutionRequest>,
) -> Response {
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok());

    match state
        .service
        .start_execution(
            &req.workflow_name,
            req.version.as_deref(),
            req.input,
            idempotency_key,
        )
        .await
    {
        Ok(StartOutcome::Started(view)) => (StatusCode::CREATED, Json(view)).into_response(),
        Ok(StartOutcome::Existing(view)) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

/// GET /v1/executions - List executions
#[utoipa::path(
    get,
    path = "/v1/executions",
    params(
        ("statuses" = Option<String>, Query, description = "Comma-separated status filter"),
        ("workflowName" = Option<String>, Query, description = "Filter by workflow name"),
        ("limit" = Option<i64>, Query, description = "Max results (default 50)"),
        ("offset" = Option<i64>, Query, description = "Pagination offset")
    ),
    responses(
        (status = 200, description = "Matching executions", body = Vec<ExecutionView>)
    ),
    tag = "executions"
)]
pub async fn list_executions(
    State(state): State<AppState>,
    Query(params): Query<ListExecutionsParams>,
) -> Response {
    let statuses = match params.statuses.as_deref() {
        None => None,
        Some(raw) => {
            let mut parsed = Vec::new();
            for status in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match status.parse() {
                    Ok(status) => parsed.push(status),
                    Err(_) => return bad_request(format!("unknown execution status: {status}")),
                }
            }
            Some(parsed)
        }
    };

    let filter = ExecutionFilter {
        statuses,
        workflow_name: params.workflow_name,
        started_after: params.started_after,
        started_before: params.started_before,
        limit: params.limit,
        offset: params.offset,
    };

    match state.service.list_executions(&filter).await {
        Ok(views) => Json(views).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

/// GET /v1/executions/{execution_id} - Fetch one execution
#[utoipa::path(
    get,
    path = "/v1/executions/{execution_id}",
    params(("execution_id" = String, Path, description = "User-visible execution id")),
    responses(
        (status = 200, description = "The execution", body = ExecutionView),
        (status = 404, description = "Unknown execution")
    ),
    tag = "executions"
)]
pub async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<ExecutionView>, ApiError> {
    Ok(Json(state.service.get_execution(&execution_id).await?))
}

/// GET /v1/executions/{execution_id}/steps/{step_id} - Fetch one step
#[utoipa::path(
    get,
    path = "/v1/executions/{execution_id}/steps/{step_id}",
    params(
        ("execution_id" = String, Path, description = "User-visible execution id"),
        ("step_id" = Uuid, Path, description = "Step id")
    ),
    responses(
        (status = 200, description = "The step with its history", body = StepView),
        (status = 404, description = "Unknown execution or step")
    ),
    tag = "executions"
)]
pub async fn get_execution_step(
    State(state): State<AppState>,
    Path((execution_id, step_id)): Path<(String, Uuid)>,
) -> Result<Json<StepView>, ApiError> {
    Ok(Json(state.service.get_step(&execution_id, step_id).await?))
}

/// GET /v1/executions/{execution_id}/history - Full audit log
#[utoipa::path(
    get,
    path = "/v1/executions/{execution_id}/history",
    params(("execution_id" = String, Path, description = "User-visible execution id")),
    responses(
        (status = 200, description = "History events ordered by (timestamp, id)", body = Vec<HistoryView>),
        (status = 404, description = "Unknown execution")
    ),
    tag = "executions"
)]
pub async fn get_execution_history(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<Vec<HistoryView>>, ApiError> {
    Ok(Json(state.service.list_history(&execution_id).await?))
}

/// POST /v1/executions/{execution_id}/cancel - Cancel a running execution
#[utoipa::path(
    post,
    path = "/v1/executions/{execution_id}/cancel",
    params(("execution_id" = String, Path, description = "User-visible execution id")),
    responses(
        (status = 200, description = "Execution cancelled", body = ExecutionView),
        (status = 404, description = "Unknown execution"),
        (status = 409, description = "Execution is not RUNNING")
    ),
    tag = "executions"
)]
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<ExecutionView>, ApiError> {
    Ok(Json(state.service.cancel_execution(&execution_id).await?))
}
