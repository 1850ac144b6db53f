use std::time::Duration;

use futures::future::join_all;

use crate::model::Sample;
use crate::sinks::SinkHandle;

/// Fan a sample out to every enabled, non-backed-off sink concurrently,
/// bounded by `deadline`. A sink stuck past the deadline is
/// abandoned for this tick — availability over retry.
pub async fn persist(sample: &Sample, table: &str, sinks: &[&SinkHandle], deadline: Duration) {
    let writes = sinks.iter().map(|handle| async move {
        if !handle.is_available().await {
            return;
        }
        if tokio::time::timeout(deadline, handle.try_write(table, sample))
            .await
            .is_err()
        {
            tracing::warn!(sink = handle.name(), table, "sink write abandoned at deadline");
        }
    });
    join_all(writes).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CpuSnapshot, DiskIoSnapshot, DiskSnapshot, NetworkIoSnapshot, ProcessSnapshot, RamSnapshot,
    };
    use crate::sinks::file::FileSink;
    use crate::sinks::Sink;
    use std::sync::Arc;

    fn sample_at(timestamp: chrono::DateTime<chrono::Utc>) -> Sample {
        Sample {
            timestamp,
            cpu: CpuSnapshot {
                usage_percent: 1.0,
                core_count: 1,
                load_average_1: 0.0,
                load_average_5: 0.0,
                load_average_15: 0.0,
                architecture: "x86_64".into(),
            },
            ram: RamSnapshot {
                total_bytes: 100,
                used_bytes: 1,
                available_bytes: 99,
                buffer_cache_bytes: 0,
                used_pct: 1.0,
            },
            disks: vec![DiskSnapshot {
                path: "/".into(),
                total_bytes: 100,
                used_bytes: 1,
                available_bytes: 99,
                used_pct: 1.0,
            }],
            disk_io: DiskIoSnapshot::default(),
            network_io: NetworkIoSnapshot::default(),
            process: ProcessSnapshot::default(),
            heartbeat: vec![],
        }
    }

    #[tokio::test]
    async fn persist_writes_to_all_enabled_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileSink::new(dir.path()));
        sink.initialize().await.unwrap();
        let handle = SinkHandle::new(sink.clone());

        let sample = sample_at(chrono::Utc::now());
        persist(&sample, "default", &[&handle], Duration::from_secs(2)).await;

        let results = sink
            .query(
                "default",
                sample.timestamp - chrono::Duration::seconds(1),
                sample.timestamp + chrono::Duration::seconds(1),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }
}
