use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::collector::Collector;
use crate::config::RuntimeConfig;
use crate::heartbeat::Prober;
use crate::persist;
use crate::sinks::SinkRegistry;

pub const DEFAULT_TABLE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Running,
    Draining,
}

/// Tick-driven orchestrator (C5): collect → probe → fan-out, on a ticker
/// whose period tracks the live `RuntimeConfig`. Hot-reloads of
/// `heartbeat_targets`/`remote_servers`/`storage_backends` are picked up
/// every tick from the config watch channel with no restart; a change to
/// `refresh_interval` recreates the ticker in place. Draining is, in this
/// design, just the single tick already in flight when the new period takes
/// effect — there is no separate task to tear down.
pub struct SamplerLoop {
    collector: Arc<Collector>,
    prober: Arc<Prober>,
    registry: Arc<SinkRegistry>,
    config_rx: watch::Receiver<RuntimeConfig>,
    state: Mutex<LoopState>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl SamplerLoop {
    pub fn new(
        collector: Arc<Collector>,
        prober: Arc<Prober>,
        registry: Arc<SinkRegistry>,
        config_rx: watch::Receiver<RuntimeConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            collector,
            prober,
            registry,
            config_rx,
            state: Mutex::new(LoopState::Stopped),
            task: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub async fn state(&self) -> LoopState {
        *self.state.lock().await
    }

    /// Allocate a ticker at the current `refresh_interval` and spawn the
    /// loop task (Stopped → Running).
    pub async fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if *state != LoopState::Stopped {
            return;
        }
        *state = LoopState::Running;
        drop(state);

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run().await });
        *self.task.lock().await = Some(handle);
    }

    async fn run(self: Arc<Self>) {
        let mut config = self.config_rx.borrow().clone();
        // Ordering guarantee holds across a reconfigure restart too: this is
        // shared by every instance run inside the 'instances loop below, not
        // reset per-instance.
        let mut last_timestamp: Option<DateTime<Utc>> = None;

        'instances: loop {
            let mut ticker = tokio::time::interval(config.refresh_interval);
            ticker.tick().await; // first tick fires immediately; skip it

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.shutdown.notified() => {
                        break 'instances;
                    }
                }

                self.tick(&config, &mut last_timestamp).await;

                let mut config_rx = self.config_rx.clone();
                if config_rx.has_changed().unwrap_or(false) {
                    let new_config = config_rx.borrow_and_update().clone();
                    let restart = new_config.refresh_interval != config.refresh_interval
                        || new_config.storage_backends != config.storage_backends;
                    config = new_config;

                    if restart {
                        info!("refresh_interval or storage_backends changed, draining and restarting sampler loop");
                        *self.state.lock().await = LoopState::Draining;
                        *self.state.lock().await = LoopState::Stopped;
                        *self.state.lock().await = LoopState::Running;
                        continue 'instances;
                    }
                }
            }
        }

        *self.state.lock().await = LoopState::Stopped;
    }

    async fn tick(&self, config: &RuntimeConfig, last_timestamp: &mut Option<DateTime<Utc>>) {
        let collect_deadline = config
            .refresh_interval
            .mul_f64(0.8)
            .min(Duration::from_secs(5));

        let (collected, probes) = tokio::join!(
            self.collector.collect(collect_deadline),
            self.prober.probe(&config.heartbeat_targets)
        );

        let mut sample = match collected {
            Ok(sample) => sample,
            Err(err) => {
                warn!(error = %err, "collection failed, skipping this tick");
                return;
            }
        };
        sample.heartbeat = probes;

        // Strict monotonicity across one loop instance: if two ticks land on
        // the same wall-clock instant, nudge forward by 1us.
        if let Some(prev) = *last_timestamp {
            if sample.timestamp <= prev {
                sample.timestamp = prev + chrono::Duration::microseconds(1);
            }
        }
        *last_timestamp = Some(sample.timestamp);

        let sinks = self.registry.active(&config.storage_backends);
        persist::persist(&sample, DEFAULT_TABLE, &sinks, config.refresh_interval).await;
    }

    /// Draining → Stopped: signal the loop task and wait for the in-flight
    /// tick (if any) to finish, up to one refresh interval.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if *state == LoopState::Stopped {
            return;
        }
        *state = LoopState::Draining;
        drop(state);

        self.shutdown.notify_one();
        if let Some(handle) = self.task.lock().await.take() {
            let deadline = self.config_rx.borrow().refresh_interval + Duration::from_secs(1);
            if tokio::time::timeout(deadline, handle).await.is_err() {
                warn!("sampler loop task did not finish within the drain deadline");
            }
        }
        *self.state.lock().await = LoopState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;
    use crate::sinks::file::FileSink;
    use crate::sinks::{Sink, SinkHandle};
    use std::collections::HashSet;

    async fn registry_with_file_sink(dir: &std::path::Path) -> Arc<SinkRegistry> {
        let sink = Arc::new(FileSink::new(dir));
        sink.initialize().await.unwrap();
        Arc::new(SinkRegistry {
            file: Some(SinkHandle::new(sink)),
            embedded_sql: None,
            relational: None,
        })
    }

    #[tokio::test]
    async fn start_then_stop_transitions_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_file_sink(dir.path()).await;

        let mut backends = HashSet::new();
        backends.insert(StorageBackend::File);
        let config = RuntimeConfig {
            refresh_interval: Duration::from_millis(50),
            storage_backends: backends,
            ..RuntimeConfig::default()
        };
        let (_tx, rx) = watch::channel(config);

        let sampler = SamplerLoop::new(Arc::new(Collector::new()), Arc::new(Prober::new()), registry, rx);
        assert_eq!(sampler.state().await, LoopState::Stopped);

        sampler.start().await;
        assert_eq!(sampler.state().await, LoopState::Running);

        tokio::time::sleep(Duration::from_millis(150)).await;
        sampler.stop().await;
        assert_eq!(sampler.state().await, LoopState::Stopped);
    }

    #[tokio::test]
    async fn ticks_persist_samples_to_the_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_file_sink(dir.path()).await;
        let file_sink = registry.file.as_ref().unwrap().sink.clone();

        let mut backends = HashSet::new();
        backends.insert(StorageBackend::File);
        let config = RuntimeConfig {
            refresh_interval: Duration::from_millis(50),
            storage_backends: backends,
            ..RuntimeConfig::default()
        };
        let (_tx, rx) = watch::channel(config);

        let sampler = SamplerLoop::new(Arc::new(Collector::new()), Arc::new(Prober::new()), registry, rx);
        sampler.start().await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        sampler.stop().await;

        let tables = file_sink.list_tables().await.unwrap();
        assert_eq!(tables, vec![DEFAULT_TABLE.to_string()]);
    }

    #[tokio::test]
    async fn storage_backend_change_drains_and_restarts_with_ordering_preserved() {
        use crate::sinks::sqlite::EmbeddedSqlSink;

        let dir = tempfile::tempdir().unwrap();
        let file_sink = Arc::new(FileSink::new(dir.path()));
        file_sink.initialize().await.unwrap();
        let sql_sink = Arc::new(EmbeddedSqlSink::in_memory().await);
        sql_sink.initialize().await.unwrap();

        let registry = Arc::new(SinkRegistry {
            file: Some(SinkHandle::new(file_sink.clone())),
            embedded_sql: Some(SinkHandle::new(sql_sink.clone())),
            relational: None,
        });

        let mut file_only = HashSet::new();
        file_only.insert(StorageBackend::File);
        let config = RuntimeConfig {
            refresh_interval: Duration::from_millis(30),
            storage_backends: file_only,
            ..RuntimeConfig::default()
        };
        let (tx, rx) = watch::channel(config);

        let sampler = SamplerLoop::new(Arc::new(Collector::new()), Arc::new(Prober::new()), registry, rx);
        sampler.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut sql_only = HashSet::new();
        sql_only.insert(StorageBackend::EmbeddedSql);
        tx.send_replace(RuntimeConfig {
            refresh_interval: Duration::from_millis(30),
            storage_backends: sql_only,
            ..RuntimeConfig::default()
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        sampler.stop().await;
        assert_eq!(sampler.state().await, LoopState::Stopped);

        let far_future = Utc::now() + chrono::Duration::days(1);
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let file_rows = file_sink.query(DEFAULT_TABLE, epoch, far_future).await.unwrap();
        let sql_rows = sql_sink.query(DEFAULT_TABLE, epoch, far_future).await.unwrap();

        assert!(!file_rows.is_empty(), "file sink should have received ticks before the switch");
        assert!(!sql_rows.is_empty(), "sqlite sink should have received ticks after the switch");
        assert!(sql_rows.first().unwrap().timestamp >= file_rows.last().unwrap().timestamp);
    }
}
