use crate::config::ApiConfig;
use crate::error::{InvocationOutcome, FAILURE_MESSAGE};
use crate::pipeline::VariantPipeline;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<VariantPipeline>,
}

/// Response for a handled notification
#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub invocation_id: Uuid,
    #[serde(flatten)]
    pub outcome: InvocationOutcome,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub invocation_id: Uuid,
    pub error: String,
    pub code: String,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/events", post(handle_event))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "variant-pipeline"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let profiles: Vec<&str> = state
        .pipeline
        .profiles()
        .profiles()
        .iter()
        .map(|p| p.name.as_str())
        .collect();

    Json(serde_json::json!({
        "status": "ready",
        "profiles": profiles
    }))
}

/// Run the pipeline for a bucket notification delivered by webhook
async fn handle_event(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let invocation_id = Uuid::new_v4();
    let span = info_span!("invocation", %invocation_id, source = "webhook");

    match state.pipeline.handle_payload(&body).instrument(span).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(EventResponse {
                invocation_id,
                outcome,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                invocation_id,
                error: FAILURE_MESSAGE.to_string(),
                code: e.kind().to_string(),
            }),
        )
            .into_response(),
    }
}

/// Start the API server; returns once `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting webhook API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
