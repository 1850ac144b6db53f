use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{error, info, warn};
use url::Url;

use crate::error::ConfigError;
use crate::identifier::normalize_table_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    #[serde(alias = "sqlite")]
    EmbeddedSql,
    #[serde(alias = "postgresql", alias = "postgres")]
    Relational,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::File => "file",
            StorageBackend::EmbeddedSql => "embedded_sql",
            StorageBackend::Relational => "relational",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatTarget {
    pub name: String,
    pub url: String,
    #[serde(alias = "timeout", default = "default_probe_timeout")]
    pub timeout_seconds: u64,
}

fn default_probe_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteServer {
    pub name: String,
    pub address: String,
    pub table_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogRotateConfig {
    pub enabled: bool,
    pub max_age_days: u32,
}

impl Default for LogRotateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_age_days: 30,
        }
    }
}

/// The active configuration snapshot. Owned exclusively by the
/// `ConfigStore`; every other component holds an immutable clone obtained
/// from a `watch::Receiver`.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub refresh_interval: Duration,
    pub storage_backends: HashSet<StorageBackend>,
    pub base_log_dir: PathBuf,
    pub heartbeat_targets: Vec<HeartbeatTarget>,
    pub remote_servers: Vec<RemoteServer>,
    pub persist_server_logs: bool,
    pub logrotate: LogRotateConfig,
}

impl RuntimeConfig {
    /// Tables C6 knows about: the sampler's always-present default table plus
    /// one per configured remote server. The whitelist half of the
    /// identifier-safety contract — a client-supplied table name must both
    /// normalize to itself and appear in this set before any sink sees it.
    pub fn known_tables(&self) -> HashSet<String> {
        let mut tables = HashSet::new();
        tables.insert(normalize_table_name(crate::sampler::DEFAULT_TABLE));
        for server in &self.remote_servers {
            tables.insert(normalize_table_name(&server.table_name));
        }
        tables
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let mut storage_backends = HashSet::new();
        storage_backends.insert(StorageBackend::File);
        Self {
            refresh_interval: Duration::from_secs(2),
            storage_backends,
            base_log_dir: PathBuf::from("./logs"),
            heartbeat_targets: Vec::new(),
            remote_servers: Vec::new(),
            persist_server_logs: false,
            logrotate: LogRotateConfig::default(),
        }
    }
}

/// On-disk JSON shape (§6). Converted + validated into a `RuntimeConfig`.
#[derive(Debug, Deserialize)]
struct FileConfig {
    refresh_time: String,
    storage: Vec<StorageBackend>,
    #[serde(default)]
    persist_server_logs: bool,
    #[serde(default)]
    logrotate: LogRotateConfig,
    #[serde(default)]
    heartbeat: Vec<HeartbeatTarget>,
    #[serde(default)]
    servers: Vec<RemoteServer>,
    #[serde(default = "default_log_dir")]
    base_log_dir: String,
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

/// Parse a human duration string like "5s", "500ms", "2m", "1h". Bare
/// integers are interpreted as seconds.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (num_part, unit) = match raw.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: f64 = num_part.parse().ok()?;
    let millis = match unit {
        "ms" => value,
        "s" | "" => value * 1000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => return None,
    };
    if millis < 0.0 {
        return None;
    }
    Some(Duration::from_millis(millis as u64))
}

fn validate(config: &RuntimeConfig) -> Result<(), ConfigError> {
    if config.refresh_interval.is_zero() {
        return Err(ConfigError::InvalidRefreshInterval);
    }
    if config.storage_backends.is_empty() {
        return Err(ConfigError::NoStorageBackends);
    }
    for target in &config.heartbeat_targets {
        if Url::parse(&target.url).is_err() {
            return Err(ConfigError::InvalidHeartbeatUrl(target.url.clone()));
        }
    }
    for server in &config.remote_servers {
        if Url::parse(&server.address).is_err() {
            return Err(ConfigError::InvalidRemoteAddress(server.address.clone()));
        }
        if normalize_table_name(&server.table_name).is_empty() {
            return Err(ConfigError::InvalidTableName(server.table_name.clone()));
        }
    }
    Ok(())
}

fn from_file_config(raw: FileConfig, path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let refresh_interval = parse_duration(&raw.refresh_time).ok_or_else(|| ConfigError::Parse {
        path: path.display().to_string(),
        source: serde::de::Error::custom(format!(
            "invalid refresh_time '{}': expected e.g. '5s'",
            raw.refresh_time
        )),
    })?;

    let config = RuntimeConfig {
        refresh_interval,
        storage_backends: raw.storage.into_iter().collect(),
        base_log_dir: PathBuf::from(raw.base_log_dir),
        heartbeat_targets: raw.heartbeat,
        remote_servers: raw.servers,
        persist_server_logs: raw.persist_server_logs,
        logrotate: raw.logrotate,
    };
    validate(&config)?;
    Ok(config)
}

/// Loads, hot-reloads, and publishes `RuntimeConfig` under a watch channel.
/// The writer side is the single reconciliation task spawned by
/// `spawn_reconciler`; readers obtain a cheap `RuntimeConfig` clone via
/// `snapshot()` or by subscribing to change notifications.
pub struct ConfigStore {
    path: PathBuf,
    tx: watch::Sender<RuntimeConfig>,
    last_mtime: Mutex<Option<SystemTime>>,
    reload: Notify,
}

impl ConfigStore {
    /// Load the initial configuration from `path`. If the file does not
    /// exist, the default `RuntimeConfig` is used (§4.6).
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (initial, mtime) = match Self::try_load(&path) {
            Ok((config, mtime)) => (config, Some(mtime)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "using default config");
                (RuntimeConfig::default(), None)
            }
        };
        let (tx, _rx) = watch::channel(initial);
        Self {
            path,
            tx,
            last_mtime: Mutex::new(mtime),
            reload: Notify::new(),
        }
    }

    fn try_load(path: &Path) -> Result<(RuntimeConfig, SystemTime), ConfigError> {
        let metadata = std::fs::metadata(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mtime = metadata.modified().unwrap_or(SystemTime::now());
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let raw: FileConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        let config = from_file_config(raw, path)?;
        Ok((config, mtime))
    }

    /// Current configuration snapshot.
    pub fn snapshot(&self) -> RuntimeConfig {
        self.tx.borrow().clone()
    }

    /// Subscribe to configuration changes.
    pub fn subscribe(&self) -> watch::Receiver<RuntimeConfig> {
        self.tx.subscribe()
    }

    /// Ask the reconciler to re-check the file immediately, bypassing its
    /// low-frequency timer.
    pub fn request_reload(&self) {
        self.reload.notify_one();
    }

    /// Reconcile once: stat the file, and if its mtime advanced, parse and
    /// validate it. On success the new config is published; on failure the
    /// previous config is retained and the error logged (§4.6 step 4).
    async fn reconcile_once(&self) {
        let mtime = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => return, // file absent — keep running on defaults/previous config
        };

        {
            let mut last = self.last_mtime.lock().await;
            if let Some(prev) = *last {
                if mtime <= prev {
                    return;
                }
            }
            *last = Some(mtime);
        }

        match Self::try_load(&self.path) {
            Ok((config, _)) => {
                info!(path = %self.path.display(), "configuration reloaded");
                // `send` silently no-ops when the sender has zero receivers
                // (e.g. nothing has called `subscribe()` yet); `send_replace`
                // updates the stored snapshot unconditionally.
                self.tx.send_replace(config);
            }
            Err(err) => {
                error!(path = %self.path.display(), error = %err, "configuration reload failed, retaining previous config");
            }
        }
    }

    /// Spawn the low-frequency reconciler task (default interval 30s, per
    /// §4.6), which also wakes on an explicit `request_reload()`.
    pub fn spawn_reconciler(
        self: std::sync::Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.reload.notified() => {}
                }
                self.reconcile_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_suffix() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("3"), Some(Duration::from_secs(3)));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("-5s"), None);
    }

    #[test]
    fn default_config_has_one_storage_backend_and_is_valid() {
        let config = RuntimeConfig::default();
        assert!(validate(&config).is_ok());
        assert!(config.storage_backends.contains(&StorageBackend::File));
    }

    #[test]
    fn validate_rejects_zero_refresh_interval() {
        let config = RuntimeConfig {
            refresh_interval: Duration::ZERO,
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidRefreshInterval)
        ));
    }

    #[test]
    fn validate_rejects_empty_storage_backends() {
        let mut config = RuntimeConfig::default();
        config.storage_backends.clear();
        assert!(matches!(
            validate(&config),
            Err(ConfigError::NoStorageBackends)
        ));
    }

    #[test]
    fn validate_rejects_bad_heartbeat_url() {
        let mut config = RuntimeConfig::default();
        config.heartbeat_targets.push(HeartbeatTarget {
            name: "bad".into(),
            url: "not a url".into(),
            timeout_seconds: 5,
        });
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidHeartbeatUrl(_))
        ));
    }

    #[test]
    fn heartbeat_target_accepts_documented_timeout_key() {
        let target: HeartbeatTarget =
            serde_json::from_str(r#"{"name":"t","url":"http://x","timeout":9}"#).unwrap();
        assert_eq!(target.timeout_seconds, 9);
    }

    #[test]
    fn known_tables_includes_default_and_remote_servers() {
        let mut config = RuntimeConfig::default();
        config.remote_servers.push(RemoteServer {
            name: "peer".into(),
            address: "http://peer".into(),
            table_name: "Peer Table!".into(),
        });
        let known = config.known_tables();
        assert!(known.contains("default"));
        assert!(known.contains("peer_table"));
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let store = ConfigStore::load("/nonexistent/path/to/config.json");
        let config = store.snapshot();
        assert_eq!(config.refresh_interval, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn reconcile_publishes_updated_config_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"refresh_time":"1s","storage":["file"],"heartbeat":[]}"#,
        )
        .unwrap();

        let store = ConfigStore::load(&path);
        assert_eq!(store.snapshot().refresh_interval, Duration::from_secs(1));

        std::thread::sleep(Duration::from_millis(2100));
        std::fs::write(
            &path,
            r#"{"refresh_time":"5s","storage":["file"],"heartbeat":[]}"#,
        )
        .unwrap();

        store.reconcile_once().await;
        assert_eq!(store.snapshot().refresh_interval, Duration::from_secs(5));
    }
}
