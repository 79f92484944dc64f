// flowstate API server: definition registry + execution endpoints + worker

mod error;
mod executions;
mod workflows;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use flowstate_engine::prelude::*;
use flowstate_engine::store::postgres::MIGRATOR;

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ExecutionService>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        workflows::register_workflow,
        workflows::list_workflows,
        workflows::get_workflow,
        executions::start_execution,
        executions::list_executions,
        executions::get_execution,
        executions::get_execution_step,
        executions::get_execution_history,
        executions::cancel_execution,
    ),
    components(schemas(
        workflows::WorkflowRegistrationResponse,
        executions::StartExecutionRequest,
        executions::ListExecutionsParams,
        error::ErrorBody,
        flowstate_engine::service::ExecutionView,
        flowstate_engine::service::StepView,
        flowstate_engine::service::HistoryView,
        flowstate_engine::service::WorkflowView,
        flowstate_engine::service::WorkflowVersionView,
        flowstate_engine::store::ExecutionStatus,
        flowstate_engine::store::StepStatus,
    )),
    tags(
        (name = "workflows", description = "Workflow definition registration"),
        (name = "executions", description = "Execution lifecycle endpoints")
    ),
    info(
        title = "flowstate API",
        version = "0.1.0",
        description = "Durable workflow orchestration over PostgreSQL"
    )
)]
struct ApiDoc;

/// Demo handler registrations; real deployments register their own handlers.
fn build_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    let mock = Arc::new(MockTaskHandler);
    registry.register("mock", mock.clone());
    registry.register("orderService.validate", mock.clone());
    registry.register("orderService.process", mock.clone());
    registry.register("orderService.complete", mock);
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowstate_api=debug,flowstate_engine=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("flowstate-api starting...");

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .context("Failed to connect to database")?;
    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Connected to database, migrations applied");

    let store: Arc<dyn ExecutionStore> = Arc::new(PostgresExecutionStore::new(pool));
    let clock = Arc::new(SystemClock);
    let registry = Arc::new(build_registry());
    tracing::info!(handlers = registry.len(), "task registry initialized");

    let idempotency_ttl_hours: i64 = std::env::var("FLOWSTATE_IDEMPOTENCY_TTL_HOURS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(24);
    let service = Arc::new(
        ExecutionService::new(store.clone(), clock.clone())
            .with_idempotency_ttl(chrono::Duration::hours(idempotency_ttl_hours)),
    );

    let worker_config = WorkerConfig::from_env();
    let worker = Arc::new(Worker::new(
        store.clone(),
        registry.clone(),
        clock.clone(),
        worker_config,
    ));
    worker.start();

    let state = AppState { service };
    let app = Router::new()
        .merge(workflows::routes(state.clone()))
        .merge(executions::routes(state))
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    tracing::info!(port, "flowstate-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    worker.shutdown().await;
    tracing::info!("flowstate-api stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
}
