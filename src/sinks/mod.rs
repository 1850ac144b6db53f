pub mod file;
pub mod postgres;
pub mod sqlite;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::StorageBackend;
use crate::error::SinkError;
use crate::model::Sample;

/// Common contract every storage backend implements.
/// Downsampling itself lives in the query engine (C7) rather than being
/// duplicated per sink — a sink only advertises whether its storage layout
/// supports equal-width time bucketing via `supports_bucketing`.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_bucketing(&self) -> bool {
        false
    }

    /// Idempotent: creates or verifies schema.
    async fn initialize(&self) -> Result<(), SinkError>;

    async fn write(&self, table: &str, sample: &Sample) -> Result<(), SinkError>;

    /// Returns rows in `[from, to]`, ascending by timestamp.
    async fn query(
        &self,
        table: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Sample>, SinkError>;

    async fn list_tables(&self) -> Result<Vec<String>, SinkError>;
}

/// Exponential backoff, capped at one attempt per minute, applied per sink
/// after consecutive write failures.
struct Backoff {
    consecutive_failures: AtomicU32,
    next_attempt: Mutex<Option<Instant>>,
}

impl Backoff {
    fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            next_attempt: Mutex::new(None),
        }
    }

    async fn ready(&self) -> bool {
        match *self.next_attempt.lock().await {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }

    async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.next_attempt.lock().await = None;
    }

    async fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let delay_secs = (1u64 << failures.min(6)).min(60);
        *self.next_attempt.lock().await = Some(Instant::now() + Duration::from_secs(delay_secs));
    }
}

/// A sink plus its backoff state, as registered in the fan-out (C4).
pub struct SinkHandle {
    pub sink: Arc<dyn Sink>,
    backoff: Backoff,
}

impl SinkHandle {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            backoff: Backoff::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.sink.name()
    }

    /// Whether this sink should be attempted this tick, per its backoff
    /// state. A sink in backoff is skipped entirely for the tick.
    pub async fn is_available(&self) -> bool {
        self.backoff.ready().await
    }

    /// Attempt a write, updating backoff state and logging on failure. A
    /// failure here never propagates to the caller.
    pub async fn try_write(&self, table: &str, sample: &Sample) {
        match self.sink.write(table, sample).await {
            Ok(()) => self.backoff.record_success().await,
            Err(err) => {
                warn!(sink = self.sink.name(), table, error = %err, "sink write failed");
                self.backoff.record_failure().await;
            }
        }
    }
}

/// Every sink the process may write to, constructed once at startup (one
/// connection pool per SQL sink). Which subset is active on
/// a given tick is decided per-config by `active()`.
pub struct SinkRegistry {
    pub file: Option<SinkHandle>,
    pub embedded_sql: Option<SinkHandle>,
    pub relational: Option<SinkHandle>,
}

impl SinkRegistry {
    pub fn empty() -> Self {
        Self {
            file: None,
            embedded_sql: None,
            relational: None,
        }
    }

    pub fn by_backend(&self, backend: StorageBackend) -> Option<&SinkHandle> {
        match backend {
            StorageBackend::File => self.file.as_ref(),
            StorageBackend::EmbeddedSql => self.embedded_sql.as_ref(),
            StorageBackend::Relational => self.relational.as_ref(),
        }
    }

    /// Sinks enabled by `backends`, in no particular order. Used by the
    /// persistence fan-out (C4); a backend named in config but never
    /// constructed (e.g. Postgres unreachable at startup) is silently
    /// absent rather than an error — it simply receives no writes.
    pub fn active(&self, backends: &std::collections::HashSet<StorageBackend>) -> Vec<&SinkHandle> {
        backends
            .iter()
            .filter_map(|backend| self.by_backend(*backend))
            .collect()
    }

    /// First initialized backend in the query-preference order
    /// `[relational, embedded_sql, file]`, optionally
    /// overridden by an explicit preference.
    pub fn preferred(&self, prefer: Option<StorageBackend>) -> Option<&SinkHandle> {
        if let Some(backend) = prefer {
            if let Some(handle) = self.by_backend(backend) {
                return Some(handle);
            }
        }
        self.relational
            .as_ref()
            .or(self.embedded_sql.as_ref())
            .or(self.file.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backoff_blocks_after_failure_and_recovers_after_success() {
        let backoff = Backoff::new();
        assert!(backoff.ready().await);

        backoff.record_failure().await;
        assert!(!backoff.ready().await);

        backoff.record_success().await;
        assert!(backoff.ready().await);
    }

    #[tokio::test]
    async fn backoff_delay_is_capped_at_sixty_seconds() {
        let backoff = Backoff::new();
        for _ in 0..10 {
            backoff.record_failure().await;
        }
        let next = backoff.next_attempt.lock().await.unwrap();
        assert!(next <= Instant::now() + Duration::from_secs(61));
    }
}
