use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::collector::Collector;
use crate::config::{ConfigStore, StorageBackend};
use crate::error::QueryError;
use crate::heartbeat::Prober;
use crate::identifier::normalize_table_name;
use crate::model::Sample;
use crate::sinks::SinkRegistry;

/// Parameters of a `/monitoring` request, already parsed.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub table_name: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub max_points: Option<usize>,
    pub backend: Option<StorageBackend>,
}

/// Serves the live sample or range-filtered, downsampled history (C7).
pub struct QueryEngine {
    collector: Arc<Collector>,
    prober: Arc<Prober>,
    registry: Arc<SinkRegistry>,
    config: Arc<ConfigStore>,
}

impl QueryEngine {
    pub fn new(
        collector: Arc<Collector>,
        prober: Arc<Prober>,
        registry: Arc<SinkRegistry>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            collector,
            prober,
            registry,
            config,
        }
    }

    async fn live_sample(&self) -> Sample {
        let config = self.config.snapshot();
        let collect_deadline = config
            .refresh_interval
            .mul_f64(0.8)
            .min(Duration::from_secs(5));
        let (collected, probes) = tokio::join!(
            self.collector.collect(collect_deadline),
            self.prober.probe(&config.heartbeat_targets)
        );
        let mut sample = collected.unwrap_or_else(|_| Sample {
            timestamp: Utc::now(),
            cpu: crate::model::CpuSnapshot {
                usage_percent: 0.0,
                core_count: 1,
                load_average_1: 0.0,
                load_average_5: 0.0,
                load_average_15: 0.0,
                architecture: String::new(),
            },
            ram: Default::default(),
            disks: Vec::new(),
            disk_io: Default::default(),
            network_io: Default::default(),
            process: Default::default(),
            heartbeat: Vec::new(),
        });
        sample.heartbeat = probes;
        sample
    }

    pub async fn query(&self, request: QueryRequest) -> Result<Vec<Sample>, QueryError> {
        if request.from.is_none() && request.to.is_none() {
            return Ok(vec![self.live_sample().await]);
        }

        let from = match &request.from {
            Some(raw) => parse_bound(raw).map_err(|_| QueryError::InvalidRange {
                from: raw.clone(),
                to: request.to.clone().unwrap_or_default(),
            })?,
            None => DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
        };
        let to = match &request.to {
            Some(raw) => parse_bound(raw).map_err(|_| QueryError::InvalidRange {
                from: request.from.clone().unwrap_or_default(),
                to: raw.clone(),
            })?,
            None => Utc::now(),
        };
        if from > to {
            return Err(QueryError::InvalidRange {
                from: from.to_rfc3339(),
                to: to.to_rfc3339(),
            });
        }

        let handle = self
            .registry
            .preferred(request.backend)
            .ok_or(QueryError::NotInitialized)?;

        let table = normalize_table_name(request.table_name.as_deref().unwrap_or(crate::sampler::DEFAULT_TABLE));
        let known_tables = self.config.snapshot().known_tables();
        if !known_tables.contains(&table) {
            return Err(QueryError::UnknownTable(table));
        }

        let rows = handle.sink.query(&table, from, to).await?;
        if rows.is_empty() {
            // "never empty" — fall back to the current live sample.
            return Ok(vec![self.live_sample().await]);
        }

        let max_points = request.max_points.unwrap_or(0);
        if max_points == 0 || rows.len() <= max_points {
            return Ok(rows);
        }

        if handle.sink.supports_bucketing() {
            Ok(bucket(rows, from, to, max_points))
        } else {
            Ok(decimate(rows, max_points))
        }
    }
}

fn parse_bound(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

/// Linear decimation: keep every `ceil(n / max_points)`-th row, preserving
/// ascending order. Used for backends without time bucketing.
fn decimate(rows: Vec<Sample>, max_points: usize) -> Vec<Sample> {
    let stride = rows.len().div_ceil(max_points).max(1);
    rows.into_iter().step_by(stride).collect()
}

/// Partition `[from, to]` into `max_points` equal-width buckets and
/// aggregate each non-empty bucket into one sample: average for
/// percentages/load-averages, last-value for monotonic counters, max for
/// zombie process count.
fn bucket(rows: Vec<Sample>, from: DateTime<Utc>, to: DateTime<Utc>, max_points: usize) -> Vec<Sample> {
    let span = (to - from).num_milliseconds().max(1) as f64;
    let width_ms = span / max_points as f64;

    let mut buckets: Vec<Vec<Sample>> = vec![Vec::new(); max_points];
    for row in rows {
        let offset_ms = (row.timestamp - from).num_milliseconds() as f64;
        let index = ((offset_ms / width_ms) as usize).min(max_points - 1);
        buckets[index].push(row);
    }

    buckets
        .into_iter()
        .filter(|bucket| !bucket.is_empty())
        .map(aggregate_bucket)
        .collect()
}

fn aggregate_bucket(bucket: Vec<Sample>) -> Sample {
    let n = bucket.len() as f64;
    let last = bucket.last().unwrap().clone();

    let avg = |f: fn(&Sample) -> f64| bucket.iter().map(f).sum::<f64>() / n;
    let max_i64 = |f: fn(&Sample) -> i64| bucket.iter().map(f).max().unwrap_or(0);

    Sample {
        timestamp: last.timestamp,
        cpu: crate::model::CpuSnapshot {
            usage_percent: avg(|s| s.cpu.usage_percent),
            core_count: last.cpu.core_count,
            load_average_1: avg(|s| s.cpu.load_average_1),
            load_average_5: avg(|s| s.cpu.load_average_5),
            load_average_15: avg(|s| s.cpu.load_average_15),
            architecture: last.cpu.architecture.clone(),
        },
        ram: crate::model::RamSnapshot {
            total_bytes: last.ram.total_bytes,
            used_bytes: last.ram.used_bytes,
            available_bytes: last.ram.available_bytes,
            buffer_cache_bytes: last.ram.buffer_cache_bytes,
            used_pct: avg(|s| s.ram.used_pct),
        },
        disks: last.disks,
        disk_io: last.disk_io,
        network_io: last.network_io,
        process: crate::model::ProcessSnapshot {
            total: last.process.total,
            running: last.process.running,
            sleeping: last.process.sleeping,
            zombie: max_i64(|s| s.process.zombie),
            stopped: last.process.stopped,
        },
        heartbeat: last.heartbeat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::file::FileSink;
    use crate::sinks::{Sink, SinkHandle, SinkRegistry};

    async fn engine_with_file_sink(dir: &std::path::Path) -> QueryEngine {
        let sink = Arc::new(FileSink::new(dir));
        sink.initialize().await.unwrap();
        let registry = Arc::new(SinkRegistry {
            file: Some(SinkHandle::new(sink)),
            embedded_sql: None,
            relational: None,
        });
        let config = Arc::new(ConfigStore::load("/nonexistent/path/to/config.json"));
        QueryEngine::new(Arc::new(Collector::new()), Arc::new(Prober::new()), registry, config)
    }

    #[tokio::test]
    async fn query_rejects_table_name_not_known_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_file_sink(dir.path()).await;

        let request = QueryRequest {
            table_name: Some("nobody_configured_this".into()),
            from: Some("2024-01-01T00:00:00Z".into()),
            to: Some("2024-01-02T00:00:00Z".into()),
            max_points: None,
            backend: None,
        };
        let result = engine.query(request).await;
        assert!(matches!(result, Err(QueryError::UnknownTable(_))));
    }

    fn sample_at(ms: i64, usage: f64) -> Sample {
        Sample {
            timestamp: DateTime::<Utc>::from_timestamp(0, 0).unwrap() + chrono::Duration::milliseconds(ms),
            cpu: crate::model::CpuSnapshot {
                usage_percent: usage,
                core_count: 4,
                load_average_1: 1.0,
                load_average_5: 1.0,
                load_average_15: 1.0,
                architecture: "x86_64".into(),
            },
            ram: Default::default(),
            disks: vec![],
            disk_io: Default::default(),
            network_io: Default::default(),
            process: Default::default(),
            heartbeat: vec![],
        }
    }

    #[test]
    fn decimate_keeps_first_row_and_respects_stride() {
        let rows: Vec<Sample> = (0..10).map(|i| sample_at(i * 1000, i as f64)).collect();
        let out = decimate(rows, 3);
        assert!(out.len() <= 3 + 1);
        assert_eq!(out[0].cpu.usage_percent, 0.0);
    }

    #[test]
    fn bucket_averages_percentages_and_keeps_ascending_order() {
        let from = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let to = from + chrono::Duration::seconds(10);
        let rows: Vec<Sample> = (0..10).map(|i| sample_at(i * 1000, 10.0)).collect();
        let out = bucket(rows, from, to, 2);
        assert!(!out.is_empty());
        for pair in out.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        for sample in &out {
            assert_eq!(sample.cpu.usage_percent, 10.0);
        }
    }

    #[test]
    fn parse_bound_accepts_rfc3339() {
        assert!(parse_bound("2024-01-01T00:00:00Z").is_ok());
        assert!(parse_bound("not-a-date").is_err());
    }
}
