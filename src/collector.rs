use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Disks, ProcessRefreshKind, RefreshKind, System};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::CollectionError;
use crate::model::{
    clamp_pct, CpuSnapshot, DiskIoSnapshot, DiskSnapshot, NetworkIoSnapshot, ProcessSnapshot,
    RamSnapshot, Sample,
};
use crate::procfs;

/// Reads `/proc/stat` twice (on consecutive calls) and reports the busy
/// fraction over the elapsed interval. Mirrors the delta-sampling approach
/// production agents use when a library-provided instantaneous reading
/// isn't available; state is kept between ticks rather than inside one
/// call, so the very first sample of a process's lifetime has no prior
/// snapshot to diff against and reports `None`.
struct CpuTimes {
    idle: u64,
    total: u64,
}

struct CpuDeltaSampler {
    prev: Option<CpuTimes>,
}

impl CpuDeltaSampler {
    fn new() -> Self {
        Self { prev: None }
    }

    /// Returns `None` on the first call or on non-Linux systems.
    fn sample(&mut self) -> Option<f64> {
        let contents = std::fs::read_to_string("/proc/stat").ok()?;
        let line = contents.lines().find(|l| l.starts_with("cpu "))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .take(8)
            .filter_map(|s| s.parse().ok())
            .collect();
        if fields.len() < 4 {
            return None;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        let current = CpuTimes { idle, total };

        let result = self.prev.as_ref().and_then(|prev| {
            let d_total = current.total.saturating_sub(prev.total);
            let d_idle = current.idle.saturating_sub(prev.idle);
            if d_total == 0 {
                None
            } else {
                Some(clamp_pct((d_total - d_idle) as f64 / d_total as f64 * 100.0))
            }
        });
        self.prev = Some(current);
        result
    }
}

/// Produces one immutable `Sample` on demand (C1). Each call fans sub-
/// collection out across CPU, memory, disk-space, disk I/O, network I/O,
/// process-table, and load-average, each bounded by a shared deadline. A
/// sub-collector that misses the deadline contributes a degraded section
/// instead of failing the whole sample.
pub struct Collector {
    cpu_sampler: Arc<Mutex<CpuDeltaSampler>>,
    last_good: Mutex<Option<Sample>>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self {
            cpu_sampler: Arc::new(Mutex::new(CpuDeltaSampler::new())),
            last_good: Mutex::new(None),
        }
    }

    /// Collect one `Sample`. `deadline` bounds every sub-collector; the
    /// overall call never takes meaningfully longer than `deadline` plus
    /// task-scheduling overhead.
    pub async fn collect(&self, deadline: Duration) -> Result<Sample, CollectionError> {
        let timestamp = chrono::Utc::now();

        let prior = self.last_good.lock().await.clone();

        let cpu_task = {
            let prior = prior.clone();
            let sampler = self.cpu_sampler.clone();
            tokio::spawn(collect_cpu(sampler, prior))
        };
        let ram_task = {
            let prior = prior.clone();
            tokio::task::spawn_blocking(move || collect_ram(prior))
        };
        let disks_task = {
            let prior = prior.clone();
            tokio::task::spawn_blocking(move || collect_disks(prior))
        };
        let disk_io_task = {
            let prior = prior.clone();
            tokio::task::spawn_blocking(move || collect_disk_io(prior))
        };
        let network_io_task = {
            let prior = prior.clone();
            tokio::task::spawn_blocking(move || collect_network_io(prior))
        };
        let process_task = {
            let prior = prior.clone();
            tokio::task::spawn_blocking(move || collect_process(prior))
        };

        let cpu = await_degraded(
            "cpu",
            deadline,
            cpu_task,
            prior.as_ref().map(|s| s.cpu.clone()).unwrap_or_else(default_cpu),
        )
        .await;
        let ram = await_degraded(
            "ram",
            deadline,
            ram_task,
            prior.as_ref().map(|s| s.ram.clone()).unwrap_or_default(),
        )
        .await;
        let disks = await_degraded(
            "disks",
            deadline,
            disks_task,
            prior.as_ref().map(|s| s.disks.clone()).unwrap_or_default(),
        )
        .await;
        let disk_io = await_degraded(
            "disk_io",
            deadline,
            disk_io_task,
            prior.as_ref().map(|s| s.disk_io.clone()).unwrap_or_default(),
        )
        .await;
        let network_io = await_degraded(
            "network_io",
            deadline,
            network_io_task,
            prior
                .as_ref()
                .map(|s| s.network_io.clone())
                .unwrap_or_default(),
        )
        .await;
        let process = await_degraded(
            "process",
            deadline,
            process_task,
            prior.as_ref().map(|s| s.process.clone()).unwrap_or_default(),
        )
        .await;

        let sample = Sample {
            timestamp,
            cpu,
            ram,
            disks,
            disk_io,
            network_io,
            process,
            heartbeat: Vec::new(),
        };

        *self.last_good.lock().await = Some(sample.clone());
        Ok(sample)
    }
}

async fn collect_cpu(sampler: Arc<Mutex<CpuDeltaSampler>>, prior: Option<Sample>) -> CpuSnapshot {
    let usage_percent = {
        let mut sampler = sampler.lock().await;
        sampler
            .sample()
            .unwrap_or_else(|| prior.as_ref().map(|s| s.cpu.usage_percent).unwrap_or(0.0))
    };

    let load = System::load_average();
    let core_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    CpuSnapshot {
        usage_percent,
        core_count,
        load_average_1: load.one,
        load_average_5: load.five,
        load_average_15: load.fifteen,
        architecture: System::cpu_arch(),
    }
}

fn default_cpu() -> CpuSnapshot {
    CpuSnapshot {
        usage_percent: 0.0,
        core_count: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        load_average_1: 0.0,
        load_average_5: 0.0,
        load_average_15: 0.0,
        architecture: System::cpu_arch(),
    }
}

fn collect_ram(_prior: Option<Sample>) -> RamSnapshot {
    let mut system = System::new_with_specifics(RefreshKind::nothing().with_memory(Default::default()));
    system.refresh_memory();

    let total_bytes = system.total_memory();
    let available_bytes = system.available_memory();
    let used_bytes = total_bytes.saturating_sub(available_bytes);
    // `available` counts reclaimable page cache as free; the gap between it
    // and the strictly-unused `free_memory()` is buffer/cache space.
    let buffer_cache_bytes = available_bytes.saturating_sub(system.free_memory());
    let used_pct = if total_bytes == 0 {
        0.0
    } else {
        clamp_pct(used_bytes as f64 / total_bytes as f64 * 100.0)
    };

    RamSnapshot {
        total_bytes,
        used_bytes,
        available_bytes,
        buffer_cache_bytes,
        used_pct,
    }
}

fn collect_disks(_prior: Option<Sample>) -> Vec<DiskSnapshot> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .map(|disk| {
            let total_bytes = disk.total_space();
            let available_bytes = disk.available_space();
            let used_bytes = total_bytes.saturating_sub(available_bytes);
            let used_pct = if total_bytes == 0 {
                0.0
            } else {
                clamp_pct(used_bytes as f64 / total_bytes as f64 * 100.0)
            };
            DiskSnapshot {
                path: disk.mount_point().display().to_string(),
                total_bytes,
                used_bytes,
                available_bytes,
                used_pct,
            }
        })
        .collect()
}

fn collect_disk_io(prior: Option<Sample>) -> DiskIoSnapshot {
    procfs::read_disk_io().unwrap_or_else(|| prior.map(|s| s.disk_io).unwrap_or_default())
}

fn collect_network_io(prior: Option<Sample>) -> NetworkIoSnapshot {
    procfs::read_network_io().unwrap_or_else(|| prior.map(|s| s.network_io).unwrap_or_default())
}

fn collect_process(_prior: Option<Sample>) -> ProcessSnapshot {
    let mut system =
        System::new_with_specifics(RefreshKind::nothing().with_processes(ProcessRefreshKind::everything()));
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

    let mut snapshot = ProcessSnapshot::default();
    for process in system.processes().values() {
        snapshot.total += 1;
        match process.status() {
            sysinfo::ProcessStatus::Run => snapshot.running += 1,
            sysinfo::ProcessStatus::Sleep | sysinfo::ProcessStatus::Idle => snapshot.sleeping += 1,
            sysinfo::ProcessStatus::Zombie => snapshot.zombie += 1,
            sysinfo::ProcessStatus::Stop => snapshot.stopped += 1,
            _ => {}
        }
    }
    snapshot
}

/// Await a spawned sub-collector up to `deadline`; on timeout, join error,
/// or panic, log a warning and fall back to `degraded`.
async fn await_degraded<T>(
    section: &'static str,
    deadline: Duration,
    task: tokio::task::JoinHandle<T>,
    degraded: T,
) -> T {
    match tokio::time::timeout(deadline, task).await {
        Ok(Ok(value)) => value,
        Ok(Err(join_err)) => {
            warn!(section, error = %join_err, "sub-collector task failed, using degraded value");
            degraded
        }
        Err(_) => {
            warn!(section, "sub-collector timed out, using degraded value");
            degraded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_produces_a_sample_within_deadline() {
        let collector = Collector::new();
        let sample = collector.collect(Duration::from_secs(5)).await.unwrap();
        assert!(sample.ram.used_bytes + sample.ram.available_bytes <= sample.ram.total_bytes);
        for disk in &sample.disks {
            assert!(disk.used_bytes + disk.available_bytes <= disk.total_bytes);
            assert!(!disk.path.is_empty());
        }
        assert!(sample.cpu.core_count >= 1);
    }

    #[tokio::test]
    async fn consecutive_collects_reuse_prior_sample_on_degraded_fields() {
        let collector = Collector::new();
        let first = collector.collect(Duration::from_secs(5)).await.unwrap();
        let second = collector.collect(Duration::from_secs(5)).await.unwrap();
        assert!(second.timestamp >= first.timestamp);
    }
}
