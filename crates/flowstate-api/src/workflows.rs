// Workflow definition registration and listing routes

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use flowstate_engine::service::WorkflowView;

use crate::error::{bad_request, ApiError};
use crate::AppState;

/// Response for a successful registration
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRegistrationResponse {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub message: String,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/workflows", get(list_workflows).post(register_workflow))
        .route("/v1/workflows/:id", get(get_workflow))
        .with_state(state)
}

/// POST /v1/workflows - Register a workflow definition version
///
/// Accepts the definition as JSON, or as YAML when the request carries a
/// YAML content type; YAML is normalized to JSON before storage.
#[utoipa::path(
    post,
    path = "/v1/workflows",
    request_body = String,
    responses(
        (status = 201, description = "Workflow version registered", body = WorkflowRegistrationResponse),
        (status = 400, description = "Malformed or invalid definition"),
        (status = 409, description = "Version already exists")
    ),
    tag = "workflows"
)]
pub async fn register_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let is_yaml = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("yaml"))
        .unwrap_or(false);

    let definition: Value = if is_yaml {
        match serde_yaml::from_str(&body) {
            Ok(value) => value,
            Err(e) => return bad_request(format!("invalid YAML definition: {e}")),
        }
    } else {
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(e) => return bad_request(format!("invalid JSON definition: {e}")),
        }
    };

    let Some(name) = definition.get("name").and_then(Value::as_str).map(str::to_string) else {
        return bad_request("definition is missing 'name'");
    };
    let Some(version) = definition
        .get("version")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return bad_request("definition is missing 'version'");
    };
    let description = definition
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string);

    match state
        .service
        .register_workflow(&name, &version, description.as_deref(), definition)
        .await
    {
        Ok(view) => (
            StatusCode::CREATED,
            Json(WorkflowRegistrationResponse {
                id: view.id,
                name,
                version,
                message: "Workflow version registered".to_string(),
            }),
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

/// GET /v1/workflows - List registered workflows with their versions
#[utoipa::path(
    get,
    path = "/v1/workflows",
    responses(
        (status = 200, description = "Registered workflows", body = Vec<WorkflowView>)
    ),
    tag = "workflows"
)]
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkflowView>>, ApiError> {
    Ok(Json(state.service.list_workflows().await?))
}

/// GET /v1/workflows/{id} - Fetch one workflow with its versions
#[utoipa::path(
    get,
    path = "/v1/workflows/{id}",
    params(("id" = Uuid, Path, description = "Workflow id")),
    responses(
        (status = 200, description = "The workflow", body = WorkflowView),
        (status = 404, description = "Unknown workflow")
    ),
    tag = "workflows"
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowView>, ApiError> {
    Ok(Json(state.service.get_workflow(id).await?))
}
