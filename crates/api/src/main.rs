use anyhow::{Context, Result};
use api::metrics::MetricsSnapshot;
use api::{AppConfig, ExtractionRequest, ExtractionResponse, ExtractionService, PipelineError, SchemaDefinition};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
};
use extract::{CancellationToken, SchemaError, SchemaSpec};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AppState {
    service: Arc<ExtractionService>,
    request_timeout: Duration,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    store: String,
    backend: String,
    strategies: Vec<String>,
}

type ApiError = (StatusCode, Json<Value>);

fn error_response(err: PipelineError) -> ApiError {
    let status = match &err {
        PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PipelineError::Schema(SchemaError::NotFound(_)) => StatusCode::NOT_FOUND,
        PipelineError::Schema(SchemaError::Persistence(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        PipelineError::Schema(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Retrieval(_) => StatusCode::BAD_GATEWAY,
        PipelineError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        // Nobody is listening any more; the code only shows up in logs.
        PipelineError::Cancelled => StatusCode::REQUEST_TIMEOUT,
    };
    tracing::warn!(status = status.as_u16(), error = %err, "Request failed");
    (status, Json(json!({ "error": err.to_string() })))
}

/// Cancels the request's token when the handler future is dropped, which
/// axum does when the client goes away.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load()?;
    let service = ExtractionService::from_config(&config)
        .await
        .context("Failed to build extraction service")?;

    let state = AppState {
        service: Arc::new(service),
        request_timeout: Duration::from_secs(config.concurrency.request_timeout_secs),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/extract", post(run_extraction))
        .route("/schemas/:owner", put(put_schema).get(get_schema).delete(delete_schema))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    tracing::info!(bind = %config.server.bind, "Server listening");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (status, store) = match state.service.store_health().await {
        Ok(()) => ("ok", "ok".to_string()),
        Err(e) => {
            tracing::warn!(error = %e, "Chunk store health check failed");
            ("degraded", e.to_string())
        }
    };
    Json(HealthResponse {
        status,
        store,
        backend: state.service.backend_model().to_string(),
        strategies: state.service.strategy_names().into_iter().map(str::to_string).collect(),
    })
}

async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.service.metrics().snapshot())
}

async fn run_extraction(
    State(state): State<AppState>,
    Json(req): Json<ExtractionRequest>,
) -> Result<Json<ExtractionResponse>, ApiError> {
    let token = CancellationToken::new();
    let _guard = CancelOnDrop(token.clone());

    match tokio::time::timeout(state.request_timeout, state.service.run_extraction(req, &token)).await {
        Ok(result) => result.map(Json).map_err(error_response),
        Err(_) => {
            token.cancel();
            tracing::warn!(timeout_secs = state.request_timeout.as_secs(), "Extraction request timed out");
            Err((
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({ "error": "extraction request timed out" })),
            ))
        }
    }
}

async fn put_schema(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Json(body): Json<SchemaDefinition>,
) -> Result<Json<SchemaSpec>, ApiError> {
    let defs = body.into_field_defs().map_err(error_response)?;
    let spec = state
        .service
        .registry()
        .build_dynamic_schema(&owner, defs)
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(spec.as_ref().clone()))
}

async fn get_schema(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> Result<Json<SchemaSpec>, ApiError> {
    let spec = state
        .service
        .registry()
        .get(&owner)
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(spec.as_ref().clone()))
}

async fn delete_schema(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> Result<StatusCode, ApiError> {
    let removed = state
        .service
        .registry()
        .delete(&owner)
        .await
        .map_err(|e| error_response(e.into()))?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(error_response(SchemaError::NotFound(owner).into()))
    }
}
