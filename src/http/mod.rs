mod monitoring;
mod server_config;
mod tables;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{ConfigStore, StorageBackend};
use crate::error::QueryError;
use crate::query::QueryEngine;
use crate::sinks::SinkRegistry;

/// Shared state available to every handler (C8's three endpoints only — the
/// thin HTTP surface).
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub query_engine: Arc<QueryEngine>,
    pub registry: Arc<SinkRegistry>,
    pub http_client: reqwest::Client,
    /// `MONITORING_DOWNSAMPLE_MAX_POINTS` — applied when a request doesn't
    /// name its own `max_points`. 0/unset disables the default.
    pub default_max_points: Option<usize>,
    /// `HISTORICAL_QUERY_STORAGE` — preferred backend for ranged queries
    /// that don't name one explicitly.
    pub default_backend: Option<StorageBackend>,
}

/// Uniform error body, `{"status": false, "error": "<message>"}`.
pub struct ApiError(QueryError);

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
pub(crate) struct ErrorBody {
    pub(crate) status: bool,
    pub(crate) error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let body = ErrorBody {
            status: false,
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/monitoring", post(monitoring::handler))
        .route("/server-config", get(server_config::handler))
        .route("/tables", get(tables::handler))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            status: false,
            error: "not found".to_string(),
        }),
    )
}
