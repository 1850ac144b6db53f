use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Round a percentage to two decimal places and clamp it into `[0, 100]`.
pub fn clamp_pct(value: f64) -> f64 {
    let clamped = value.clamp(0.0, 100.0);
    (clamped * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuSnapshot {
    pub usage_percent: f64,
    pub core_count: usize,
    pub load_average_1: f64,
    pub load_average_5: f64,
    pub load_average_15: f64,
    pub architecture: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RamSnapshot {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub buffer_cache_bytes: u64,
    pub used_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskSnapshot {
    pub path: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DiskIoSnapshot {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_count: u64,
    pub write_count: u64,
    pub read_time_ms: u64,
    pub write_time_ms: u64,
    pub io_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NetworkIoSnapshot {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errors_in: u64,
    pub errors_out: u64,
    pub drops_in: u64,
    pub drops_out: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProcessSnapshot {
    pub total: i64,
    pub running: i64,
    pub sleeping: i64,
    pub zombie: i64,
    pub stopped: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    pub name: String,
    pub url: String,
    pub status: ProbeStatus,
    pub response_ms: i64,
    pub response_time_label: String,
    pub last_checked: DateTime<Utc>,
    pub error: String,
}

/// An immutable snapshot of host telemetry and probe results, identified by
/// its UTC timestamp. Invariants: percentages stay in range, byte
/// accounting is internally consistent, and timestamps are strictly
/// monotonic across one sampler loop instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuSnapshot,
    pub ram: RamSnapshot,
    pub disks: Vec<DiskSnapshot>,
    pub disk_io: DiskIoSnapshot,
    pub network_io: NetworkIoSnapshot,
    pub process: ProcessSnapshot,
    pub heartbeat: Vec<ProbeResult>,
}

/// Human-readable label for a response-time bucket, used by the UI.
pub fn response_time_label(response_ms: i64) -> String {
    match response_ms {
        ms if ms < 100 => "fast".to_string(),
        ms if ms < 500 => "normal".to_string(),
        ms if ms < 2000 => "slow".to_string(),
        _ => "very slow".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_pct_clamps_and_rounds() {
        assert_eq!(clamp_pct(-5.0), 0.0);
        assert_eq!(clamp_pct(150.0), 100.0);
        assert_eq!(clamp_pct(12.34567), 12.35);
    }

    #[test]
    fn response_time_label_buckets() {
        assert_eq!(response_time_label(10), "fast");
        assert_eq!(response_time_label(200), "normal");
        assert_eq!(response_time_label(1000), "slow");
        assert_eq!(response_time_label(5000), "very slow");
    }
}
