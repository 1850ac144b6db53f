//! Linux-only cumulative I/O counters that `sysinfo` does not expose
//! host-wide (per-disk and per-interface I/O, and network drop counts).
//! Returns `None` off Linux or when the relevant file can't be read, which
//! the caller treats as a degraded section.

use crate::model::{DiskIoSnapshot, NetworkIoSnapshot};

const SECTOR_BYTES: u64 = 512;

/// A device name counts as a whole disk (not a partition) when it matches
/// one of the common kernel naming schemes for physical/virtual block
/// devices: `sda`, `vda`, `xvda`, `nvme0n1`, `mmcblk0`. Partitions append a
/// trailing number (`sda1`) or `pN` (`nvme0n1p1`) and are skipped so a
/// device's I/O isn't double-counted against its own partitions.
fn is_whole_disk(name: &str) -> bool {
    if let Some(rest) = name.strip_prefix("nvme") {
        return rest
            .split_once('n')
            .map(|(_, tail)| !tail.contains('p'))
            .unwrap_or(false);
    }
    if name.starts_with("mmcblk") {
        return !name.contains('p');
    }
    if name.starts_with("sd") || name.starts_with("vd") || name.starts_with("xvd") {
        return !name.ends_with(|c: char| c.is_ascii_digit());
    }
    false
}

#[cfg(target_os = "linux")]
pub fn read_disk_io() -> Option<DiskIoSnapshot> {
    let contents = std::fs::read_to_string("/proc/diskstats").ok()?;
    let mut snapshot = DiskIoSnapshot::default();

    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 14 {
            continue;
        }
        let name = fields[2];
        if !is_whole_disk(name) {
            continue;
        }
        let parse = |idx: usize| fields.get(idx).and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);

        snapshot.read_count += parse(3);
        snapshot.read_bytes += parse(5) * SECTOR_BYTES;
        snapshot.read_time_ms += parse(6);
        snapshot.write_count += parse(7);
        snapshot.write_bytes += parse(9) * SECTOR_BYTES;
        snapshot.write_time_ms += parse(10);
        snapshot.io_time_ms += parse(12);
    }

    Some(snapshot)
}

#[cfg(not(target_os = "linux"))]
pub fn read_disk_io() -> Option<DiskIoSnapshot> {
    None
}

#[cfg(target_os = "linux")]
pub fn read_network_io() -> Option<NetworkIoSnapshot> {
    let contents = std::fs::read_to_string("/proc/net/dev").ok()?;
    let mut snapshot = NetworkIoSnapshot::default();

    for line in contents.lines().skip(2) {
        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        let iface = iface.trim();
        if iface == "lo" {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 16 {
            continue;
        }
        let parse = |idx: usize| fields.get(idx).and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);

        snapshot.bytes_recv += parse(0);
        snapshot.packets_recv += parse(1);
        snapshot.errors_in += parse(2);
        snapshot.drops_in += parse(3);
        snapshot.bytes_sent += parse(8);
        snapshot.packets_sent += parse(9);
        snapshot.errors_out += parse(10);
        snapshot.drops_out += parse(11);
    }

    Some(snapshot)
}

#[cfg(not(target_os = "linux"))]
pub fn read_network_io() -> Option<NetworkIoSnapshot> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_whole_disk_accepts_common_device_names() {
        assert!(is_whole_disk("sda"));
        assert!(is_whole_disk("vda"));
        assert!(is_whole_disk("xvda"));
        assert!(is_whole_disk("nvme0n1"));
        assert!(is_whole_disk("mmcblk0"));
    }

    #[test]
    fn is_whole_disk_rejects_partitions() {
        assert!(!is_whole_disk("sda1"));
        assert!(!is_whole_disk("nvme0n1p1"));
        assert!(!is_whole_disk("mmcblk0p1"));
    }

    #[test]
    fn is_whole_disk_rejects_unrelated_devices() {
        assert!(!is_whole_disk("loop0"));
        assert!(!is_whole_disk("dm-0"));
        assert!(!is_whole_disk("ram0"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn read_disk_io_returns_some_on_linux() {
        assert!(read_disk_io().is_some());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn read_network_io_returns_some_on_linux() {
        assert!(read_network_io().is_some());
    }
}
