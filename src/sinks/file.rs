use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::error::SinkError;
use crate::identifier::normalize_table_name;
use crate::model::Sample;

use super::Sink;

/// Appends one JSON line per sample to
/// `{base_log_dir}/{table}/{YYYY-MM-DD}.log` (UTC). Writes to a given table
/// are serialized through a per-table mutex so lines never interleave.
pub struct FileSink {
    base_dir: PathBuf,
    table_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            table_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, table: &str) -> Arc<Mutex<()>> {
        let mut locks = self.table_locks.lock().await;
        locks
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.base_dir.join(table)
    }

    fn day_file(&self, table: &str, date: NaiveDate) -> PathBuf {
        self.table_dir(table)
            .join(format!("{}.log", date.format("%Y-%m-%d")))
    }

    fn ensure_dir(path: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }

    fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o644))?;
        }
        Ok(file)
    }

    /// Delete day-files older than `max_age_days` across all known tables.
    /// Run from a background task once per hour when logrotate is enabled.
    pub async fn prune(&self, max_age_days: u32) {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(max_age_days as i64);

        let Ok(table_dirs) = std::fs::read_dir(&self.base_dir) else {
            return;
        };

        for entry in table_dirs.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let Ok(day_files) = std::fs::read_dir(entry.path()) else {
                continue;
            };
            for day_entry in day_files.flatten() {
                let file_name = day_entry.file_name();
                let Some(stem) = file_name.to_str().and_then(|s| s.strip_suffix(".log")) else {
                    continue;
                };
                let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
                    continue;
                };
                if date < cutoff {
                    if let Err(err) = std::fs::remove_file(day_entry.path()) {
                        warn!(path = %day_entry.path().display(), error = %err, "failed to prune log file");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn initialize(&self) -> Result<(), SinkError> {
        Self::ensure_dir(&self.base_dir).map_err(|source| SinkError::Io {
            sink: "file",
            source,
        })
    }

    async fn write(&self, table: &str, sample: &Sample) -> Result<(), SinkError> {
        debug_assert_eq!(table, normalize_table_name(table));
        let lock = self.lock_for(table).await;
        let _guard = lock.lock().await;

        let dir = self.table_dir(table);
        Self::ensure_dir(&dir).map_err(|source| SinkError::Io {
            sink: "file",
            source,
        })?;

        let path = self.day_file(table, sample.timestamp.date_naive());
        let mut file = Self::open_append(&path).map_err(|source| SinkError::Io {
            sink: "file",
            source,
        })?;

        let line = serde_json::to_string(sample).map_err(|err| SinkError::Io {
            sink: "file",
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        })?;

        use std::io::Write;
        writeln!(file, "{line}").map_err(|source| SinkError::Io {
            sink: "file",
            source,
        })
    }

    async fn query(
        &self,
        table: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Sample>, SinkError> {
        let dir = self.table_dir(table);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        let mut date = from.date_naive();
        let end_date = to.date_naive();
        while date <= end_date {
            let path = self.day_file(table, date);
            if let Ok(contents) = std::fs::read_to_string(&path) {
                for line in contents.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Sample>(line) {
                        Ok(sample) if sample.timestamp >= from && sample.timestamp <= to => {
                            results.push(sample);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            error!(path = %path.display(), error = %err, "skipping malformed log line")
                        }
                    }
                }
            }
            let Some(next) = date.succ_opt() else {
                break;
            };
            if date == end_date {
                break;
            }
            date = next;
        }

        results.sort_by_key(|s| s.timestamp);
        Ok(results)
    }

    async fn list_tables(&self) -> Result<Vec<String>, SinkError> {
        let Ok(entries) = std::fs::read_dir(&self.base_dir) else {
            return Ok(Vec::new());
        };
        let mut tables: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        tables.sort();
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CpuSnapshot, DiskIoSnapshot, NetworkIoSnapshot, ProcessSnapshot, RamSnapshot,
    };

    fn sample_at(timestamp: DateTime<Utc>) -> Sample {
        Sample {
            timestamp,
            cpu: CpuSnapshot {
                usage_percent: 12.5,
                core_count: 4,
                load_average_1: 0.1,
                load_average_5: 0.2,
                load_average_15: 0.3,
                architecture: "x86_64".into(),
            },
            ram: RamSnapshot {
                total_bytes: 1000,
                used_bytes: 400,
                available_bytes: 600,
                buffer_cache_bytes: 100,
                used_pct: 40.0,
            },
            disks: vec![],
            disk_io: DiskIoSnapshot::default(),
            network_io: NetworkIoSnapshot::default(),
            process: ProcessSnapshot::default(),
            heartbeat: vec![],
        }
    }

    #[tokio::test]
    async fn write_then_query_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());
        sink.initialize().await.unwrap();

        let t0 = Utc::now();
        let sample = sample_at(t0);
        sink.write("default", &sample).await.unwrap();

        let results = sink
            .query(
                "default",
                t0 - chrono::Duration::seconds(1),
                t0 + chrono::Duration::seconds(1),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], sample);
    }

    #[tokio::test]
    async fn query_excludes_samples_outside_range() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());
        sink.initialize().await.unwrap();

        let base = Utc::now();
        for i in 0..10i64 {
            let sample = sample_at(base + chrono::Duration::seconds(i));
            sink.write("default", &sample).await.unwrap();
        }

        let results = sink
            .query(
                "default",
                base + chrono::Duration::seconds(2),
                base + chrono::Duration::seconds(6),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 5);
        for pair in results.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn list_tables_reflects_directories_written() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());
        sink.initialize().await.unwrap();
        sink.write("alpha", &sample_at(Utc::now())).await.unwrap();
        sink.write("beta", &sample_at(Utc::now())).await.unwrap();

        let mut tables = sink.list_tables().await.unwrap();
        tables.sort();
        assert_eq!(tables, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[tokio::test]
    async fn prune_removes_files_older_than_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());
        sink.initialize().await.unwrap();

        let old_date = (Utc::now() - chrono::Duration::days(40)).date_naive();
        let table_dir = sink.table_dir("default");
        std::fs::create_dir_all(&table_dir).unwrap();
        std::fs::write(
            table_dir.join(format!("{}.log", old_date.format("%Y-%m-%d"))),
            "{}\n",
        )
        .unwrap();

        sink.write("default", &sample_at(Utc::now())).await.unwrap();

        sink.prune(30).await;

        let remaining: Vec<_> = std::fs::read_dir(&table_dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().into_string().unwrap())
            .collect();
        assert_eq!(remaining.len(), 1);
        assert!(!remaining[0].contains(&old_date.format("%Y-%m-%d").to_string()));
    }
}
