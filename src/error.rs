use thiserror::Error;

/// One sub-collector failed this tick. Logged; the sample is still emitted
/// with a degraded section (see `collector.rs`).
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("failed to obtain wall-clock timestamp")]
    Clock,
    #[error("sub-collector '{section}' timed out or panicked: {source}")]
    SubCollector {
        section: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// A single storage sink failed a write or query. Other sinks are unaffected.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink '{sink}' io error: {source}")]
    Io {
        sink: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("sink '{sink}' database error: {source}")]
    Database {
        sink: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("sink '{sink}' is backing off after repeated failures")]
    Backoff { sink: &'static str },
    #[error("unknown table '{0}'")]
    UnknownTable(String),
}

/// Configuration failed validation; the previous config is retained.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid refresh_time: must be > 0")]
    InvalidRefreshInterval,
    #[error("at least one storage backend must be configured")]
    NoStorageBackends,
    #[error("invalid heartbeat target url '{0}'")]
    InvalidHeartbeatUrl(String),
    #[error("invalid remote server address '{0}'")]
    InvalidRemoteAddress(String),
    #[error("table_name '{0}' normalizes to an empty identifier")]
    InvalidTableName(String),
}

/// Returned to the HTTP caller as a 4xx or 5xx, per §7.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no storage sink is initialized")]
    NotInitialized,
    #[error("invalid range: from ({from}) is after to ({to})")]
    InvalidRange { from: String, to: String },
    #[error("unknown table '{0}'")]
    UnknownTable(String),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl QueryError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            QueryError::NotInitialized => StatusCode::INTERNAL_SERVER_ERROR,
            QueryError::InvalidRange { .. } => StatusCode::BAD_REQUEST,
            QueryError::UnknownTable(_) => StatusCode::BAD_REQUEST,
            QueryError::Sink(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A condition that threatens the sampler loop's invariant (ticker
/// allocation failure, every sink down at startup, listener bind failure).
/// Propagates to `main`, which logs and exits non-zero.
#[derive(Debug, Error)]
pub enum FatalStartupError {
    #[error("failed to bind listener on {addr}: {source}")]
    ListenerBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse startup environment: {0}")]
    Environment(String),
}
