//! Filter query API: a thin read-only projection over the record store.

use crate::config::ApiConfig;
use crate::record::{FilterCriteria, ImageRecord, RecordStore};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
}

/// Successful filter response
#[derive(Debug, Serialize)]
pub struct FilterResponse {
    pub success: bool,
    pub items: Vec<ImageRecord>,
    pub count: usize,
    pub criteria: FilterCriteria,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/filter", post(filter_images))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "darkroom-pipeline"
    }))
}

/// Filter image records. Absent criteria impose no constraint; present ones
/// combine with AND.
#[instrument(skip(state, criteria))]
async fn filter_images(
    State(state): State<AppState>,
    Json(criteria): Json<FilterCriteria>,
) -> Result<Json<FilterResponse>, (StatusCode, Json<ErrorResponse>)> {
    let items = state.records.query(&criteria).await.map_err(|e| {
        error!(error = %e, "Failed to filter images");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                success: false,
                error: "Failed to filter images".to_string(),
                message: e.to_string(),
            }),
        )
    })?;

    let count = items.len();
    Ok(Json(FilterResponse {
        success: true,
        items,
        count,
        criteria,
    }))
}

/// Start the filter API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting filter API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
