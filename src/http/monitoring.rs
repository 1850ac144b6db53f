use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::model::Sample;
use crate::query::QueryRequest;

use super::{ApiError, AppState};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MonitoringBody {
    from: Option<String>,
    to: Option<String>,
    table_name: Option<String>,
    max_points: Option<usize>,
}

/// `POST /monitoring` — current live sample, or range-filtered and
/// downsampled history. POST (not GET) so the filter
/// body isn't bound by URL length limits.
pub async fn handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<MonitoringBody>>,
) -> Result<Json<Vec<Sample>>, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let request = QueryRequest {
        table_name: body.table_name,
        from: body.from,
        to: body.to,
        max_points: body.max_points.or(state.default_max_points),
        backend: state.default_backend,
    };
    let samples = state.query_engine.query(request).await?;
    Ok(Json(samples))
}
