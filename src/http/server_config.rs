use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct ServerConfigQuery {
    remote: Option<String>,
}

#[derive(Debug, Serialize)]
struct HeartbeatView {
    name: String,
    url: String,
    timeout_seconds: u64,
}

#[derive(Debug, Serialize)]
struct RemoteServerView {
    name: String,
    address: String,
    table_name: String,
}

#[derive(Debug, Serialize)]
struct PublicConfig {
    refresh_seconds: f64,
    storage: Vec<&'static str>,
    base_log_dir: String,
    heartbeat: Vec<HeartbeatView>,
    servers: Vec<RemoteServerView>,
}

fn synthesize_minimal() -> PublicConfig {
    PublicConfig {
        refresh_seconds: 2.0,
        storage: vec!["file"],
        base_log_dir: "./logs".to_string(),
        heartbeat: Vec::new(),
        servers: Vec::new(),
    }
}

/// `GET /server-config[?remote=<url>]` — the public view of `RuntimeConfig`.
/// With `remote`, proxy unchanged to an allow-listed peer (one named in this
/// instance's own `remote_servers`), falling back to a synthesized minimal
/// config on a 404 from the peer. This is a thin pass-through, not a trust
/// boundary.
pub async fn handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ServerConfigQuery>,
) -> Response {
    let config = state.config.snapshot();

    let Some(remote) = query.remote else {
        let public = PublicConfig {
            refresh_seconds: config.refresh_interval.as_secs_f64(),
            storage: config
                .storage_backends
                .iter()
                .map(|b| b.as_str())
                .collect(),
            base_log_dir: config.base_log_dir.display().to_string(),
            heartbeat: config
                .heartbeat_targets
                .iter()
                .map(|t| HeartbeatView {
                    name: t.name.clone(),
                    url: t.url.clone(),
                    timeout_seconds: t.timeout_seconds,
                })
                .collect(),
            servers: config
                .remote_servers
                .iter()
                .map(|s| RemoteServerView {
                    name: s.name.clone(),
                    address: s.address.clone(),
                    table_name: s.table_name.clone(),
                })
                .collect(),
        };
        return Json(public).into_response();
    };

    let allowed = config.remote_servers.iter().any(|s| s.address == remote);
    if !allowed {
        return (
            StatusCode::FORBIDDEN,
            Json(super::ErrorBody {
                status: false,
                error: "remote is not an allow-listed server".to_string(),
            }),
        )
            .into_response();
    }

    let url = format!("{}/server-config", remote.trim_end_matches('/'));
    match state.http_client.get(&url).send().await {
        Ok(response) if response.status() == StatusCode::NOT_FOUND => {
            Json(synthesize_minimal()).into_response()
        }
        Ok(response) => {
            let status = response.status();
            match response.bytes().await {
                Ok(body) => (status, body).into_response(),
                Err(err) => {
                    warn!(remote = %remote, error = %err, "failed to read remote server-config body");
                    Json(synthesize_minimal()).into_response()
                }
            }
        }
        Err(err) => {
            warn!(remote = %remote, error = %err, "remote server-config proxy request failed");
            Json(synthesize_minimal()).into_response()
        }
    }
}
