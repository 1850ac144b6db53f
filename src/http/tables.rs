use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use super::{ApiError, AppState};
use crate::config::StorageBackend;
use crate::error::QueryError;

/// `GET /tables` — the sorted set of normalized table names currently known
/// to any configured sink.
pub async fn handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>, ApiError> {
    let mut tables: BTreeSet<String> = BTreeSet::new();

    for backend in [
        StorageBackend::Relational,
        StorageBackend::EmbeddedSql,
        StorageBackend::File,
    ] {
        if let Some(handle) = state.registry.by_backend(backend) {
            let names = handle
                .sink
                .list_tables()
                .await
                .map_err(QueryError::Sink)?;
            tables.extend(names);
        }
    }

    Ok(Json(tables.into_iter().collect()))
}
