mod collector;
mod config;
mod error;
mod heartbeat;
mod http;
mod identifier;
mod model;
mod persist;
mod procfs;
mod query;
mod sampler;
mod sinks;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::ConfigStore;
use crate::error::FatalStartupError;
use crate::heartbeat::Prober;
use crate::http::AppState;
use crate::query::QueryEngine;
use crate::sampler::SamplerLoop;
use crate::sinks::file::FileSink;
use crate::sinks::postgres::RelationalSink;
use crate::sinks::sqlite::EmbeddedSqlSink;
use crate::sinks::{Sink, SinkHandle, SinkRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostwatch=info,tower_http=info".into()),
        )
        .init();

    info!("starting hostwatch v{}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "./config.json".to_string());
    let config_store = Arc::new(ConfigStore::load(&config_path));
    info!(path = %config_path, "configuration loaded");

    config_store.clone().spawn_reconciler(Duration::from_secs(30));

    let (registry, file_sink) = build_sink_registry(&config_store).await?;
    let registry = Arc::new(registry);

    if let Some(file_sink) = file_sink {
        spawn_logrotate(file_sink, &config_store);
    }

    let collector = Arc::new(collector::Collector::new());
    let prober = Arc::new(Prober::new());

    let sampler = SamplerLoop::new(
        collector.clone(),
        prober.clone(),
        registry.clone(),
        config_store.subscribe(),
    );
    sampler.start().await;
    info!("sampler loop running");

    let query_engine = Arc::new(QueryEngine::new(
        collector.clone(),
        prober.clone(),
        registry.clone(),
        config_store.clone(),
    ));

    let state = Arc::new(AppState {
        config: config_store.clone(),
        query_engine,
        registry: registry.clone(),
        http_client: reqwest::Client::builder()
            .timeout(Duration::from_secs(
                env::var("SERVER_MONITORING_TIMEOUT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new()),
        default_max_points: env::var("MONITORING_DOWNSAMPLE_MAX_POINTS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0),
        default_backend: historical_query_storage_from_env(),
    });

    let app = http::build_router(state);

    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let addr = format!("0.0.0.0:{port}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| FatalStartupError::ListenerBind {
            addr: addr.clone(),
            source,
        })?;
    info!(%addr, "HTTP surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server loop exited with an error")?;

    sampler.stop().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining");
}

/// Construct every sink named by environment configuration. A sink that
/// fails to connect at startup (e.g. Postgres unreachable) is logged and
/// left absent rather than treated as fatal, unless that leaves the active
/// configuration with zero reachable backends.
async fn build_sink_registry(
    config_store: &ConfigStore,
) -> Result<(SinkRegistry, Option<Arc<FileSink>>)> {
    let config = config_store.snapshot();
    let mut registry = SinkRegistry::empty();
    let mut file_sink_concrete = None;

    let base_log_dir = env::var("BASE_LOG_FOLDER")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| config.base_log_dir.clone());
    let file_sink = Arc::new(FileSink::new(base_log_dir));
    if let Err(err) = file_sink.initialize().await {
        warn!(error = %err, "file sink failed to initialize");
    } else {
        registry.file = Some(SinkHandle::new(file_sink.clone()));
        file_sink_concrete = Some(file_sink);
    }

    let sqlite_path = env::var("SQLITE_DNS").unwrap_or_else(|_| "./hostwatch.db".to_string());
    match EmbeddedSqlSink::connect(&sqlite_path).await {
        Ok(sink) => {
            let sink = Arc::new(sink);
            if let Err(err) = sink.initialize().await {
                warn!(error = %err, "embedded_sql sink failed health check");
            } else {
                registry.embedded_sql = Some(SinkHandle::new(sink));
            }
        }
        Err(err) => {
            warn!(path = %sqlite_path, error = %err, "embedded_sql sink unavailable, continuing without it");
        }
    }

    if let Some(url) = postgres_url_from_env() {
        match RelationalSink::connect(&url).await {
            Ok(sink) => {
                if let Err(err) = sink.initialize().await {
                    warn!(error = %err, "relational sink failed health check");
                } else {
                    registry.relational = Some(SinkHandle::new(Arc::new(sink)));
                }
            }
            Err(err) => {
                warn!(error = %err, "relational sink unavailable, continuing without it");
            }
        }
    }

    if registry.active(&config.storage_backends).is_empty() {
        error!("no configured storage backend is reachable");
        return Err(FatalStartupError::Environment(
            "every configured storage backend failed to initialize".to_string(),
        )
        .into());
    }

    Ok((registry, file_sink_concrete))
}

fn historical_query_storage_from_env() -> Option<crate::config::StorageBackend> {
    match env::var("HISTORICAL_QUERY_STORAGE").ok()?.as_str() {
        "sqlite" => Some(crate::config::StorageBackend::EmbeddedSql),
        "postgresql" | "postgres" => Some(crate::config::StorageBackend::Relational),
        _ => None,
    }
}

fn postgres_url_from_env() -> Option<String> {
    let user = env::var("POSTGRES_USER").ok()?;
    let password = env::var("POSTGRES_PASSWORD").unwrap_or_default();
    let host = env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let db = env::var("POSTGRES_DB").ok()?;
    Some(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}

fn spawn_logrotate(file_sink: Arc<FileSink>, config_store: &Arc<ConfigStore>) {
    let config_store = config_store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        interval.tick().await; // first tick is immediate — skip it
        loop {
            interval.tick().await;
            let config = config_store.snapshot();
            if config.logrotate.enabled {
                file_sink.prune(config.logrotate.max_age_days).await;
            }
        }
    });
}
