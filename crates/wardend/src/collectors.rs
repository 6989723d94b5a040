//! Point-in-time OS readers: memory, disk, CPU, and pending packages.
//!
//! Every reader is a single blocking read against its source. Failures
//! degrade to zeroed values with a log line so one sick source never
//! stops a sample pass.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::process::Command;
use std::sync::{Mutex, OnceLock};
use tracing::{debug, info, warn};

const MEMINFO_PATH: &str = "/proc/meminfo";
const STAT_PATH: &str = "/proc/stat";
const MOUNTS_PATH: &str = "/proc/mounts";

/// Mount types that never hold user data.
const VIRTUAL_FILESYSTEMS: &[&str] = &[
    "proc",
    "sysfs",
    "tmpfs",
    "devtmpfs",
    "cgroup",
    "cgroup2",
    "securityfs",
    "pstore",
    "debugfs",
    "configfs",
    "fusectl",
    "hugetlbfs",
    "mqueue",
    "binfmt_misc",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub buffers_bytes: u64,
    pub cached_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
}

impl MemoryStats {
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }

    pub fn used_mb(&self) -> u64 {
        self.used_bytes / (1024 * 1024)
    }

    pub fn total_mb(&self) -> u64 {
        self.total_bytes / (1024 * 1024)
    }
}

/// Read current memory stats from /proc/meminfo.
pub fn read_memory() -> MemoryStats {
    match std::fs::read_to_string(MEMINFO_PATH) {
        Ok(content) => parse_meminfo(&content),
        Err(e) => {
            warn!("Cannot read {}: {}", MEMINFO_PATH, e);
            MemoryStats::default()
        }
    }
}

fn parse_meminfo(content: &str) -> MemoryStats {
    let mut stats = MemoryStats::default();
    let mut swap_free_bytes = 0u64;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        // Values are in kB
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        let bytes = value * 1024;

        match key {
            "MemTotal:" => stats.total_bytes = bytes,
            "MemAvailable:" => stats.available_bytes = bytes,
            "Buffers:" => stats.buffers_bytes = bytes,
            "Cached:" => stats.cached_bytes = bytes,
            "SwapTotal:" => stats.swap_total_bytes = bytes,
            "SwapFree:" => swap_free_bytes = bytes,
            _ => {}
        }
    }

    stats.used_bytes = stats.total_bytes.saturating_sub(stats.available_bytes);
    stats.swap_used_bytes = stats.swap_total_bytes.saturating_sub(swap_free_bytes);
    stats
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiskStats {
    pub device: String,
    pub mount_point: String,
    pub filesystem: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
}

impl DiskStats {
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }

    pub fn used_gb(&self) -> f64 {
        self.used_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

/// Stats for the root filesystem.
pub fn read_root_disk() -> DiskStats {
    let mut stats = DiskStats {
        device: "rootfs".to_string(),
        mount_point: "/".to_string(),
        ..Default::default()
    };
    fill_statvfs(&mut stats);
    stats
}

/// Stats for every real mount, from /proc/mounts.
pub fn read_all_disks() -> Vec<DiskStats> {
    let content = match std::fs::read_to_string(MOUNTS_PATH) {
        Ok(content) => content,
        Err(e) => {
            warn!("Cannot read {}: {}", MOUNTS_PATH, e);
            return Vec::new();
        }
    };

    parse_mounts(&content)
        .into_iter()
        .filter_map(|mut stats| {
            fill_statvfs(&mut stats);
            (stats.total_bytes > 0).then_some(stats)
        })
        .collect()
}

fn fill_statvfs(stats: &mut DiskStats) {
    match nix::sys::statvfs::statvfs(stats.mount_point.as_str()) {
        Ok(vfs) => {
            let frsize = vfs.fragment_size() as u64;
            stats.total_bytes = vfs.blocks() as u64 * frsize;
            stats.available_bytes = vfs.blocks_available() as u64 * frsize;
            stats.used_bytes = stats
                .total_bytes
                .saturating_sub(vfs.blocks_free() as u64 * frsize);
        }
        Err(e) => {
            warn!("statvfs failed for {}: {}", stats.mount_point, e);
        }
    }
}

/// Parse /proc/mounts, dropping virtual filesystems and loop devices.
fn parse_mounts(content: &str) -> Vec<DiskStats> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let device = parts.next()?;
            let mount_point = parts.next()?;
            let filesystem = parts.next()?;

            if VIRTUAL_FILESYSTEMS.contains(&filesystem) || device.starts_with("/dev/loop") {
                return None;
            }

            Some(DiskStats {
                device: device.to_string(),
                mount_point: mount_point.to_string(),
                filesystem: filesystem.to_string(),
                ..Default::default()
            })
        })
        .collect()
}

/// Aggregate CPU usage since boot, as a percentage.
pub fn read_cpu_usage() -> f64 {
    let content = match std::fs::read_to_string(STAT_PATH) {
        Ok(content) => content,
        Err(e) => {
            warn!("Cannot read {}: {}", STAT_PATH, e);
            return 0.0;
        }
    };
    content
        .lines()
        .next()
        .and_then(parse_cpu_line)
        .unwrap_or(0.0)
}

fn parse_cpu_line(line: &str) -> Option<f64> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "cpu" {
        return None;
    }

    let mut fields = [0u64; 5];
    for field in fields.iter_mut() {
        *field = parts.next()?.parse().ok()?;
    }
    let [user, nice, system, idle, iowait] = fields;

    let total = user + nice + system + idle + iowait;
    if total == 0 {
        return None;
    }
    Some((user + nice + system) as f64 / total as f64 * 100.0)
}

/// One upgradable package as reported by apt.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageUpdate {
    pub name: String,
    pub source: String,
    pub available_version: String,
    pub current_version: String,
    pub is_security: bool,
}

impl std::fmt::Display for PackageUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.name, self.current_version, self.available_version
        )
    }
}

fn apt_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // package/source version arch [upgradable from: old]
        Regex::new(r"^([^/]+)/(\S+)\s+(\S+)\s+[^\[]*\[upgradable from:\s*([^\]]+)\]")
            .expect("apt line pattern")
    })
}

/// Pending-update tracker over `apt list --upgradable`.
#[derive(Default)]
pub struct AptMonitor {
    cached: Mutex<Vec<PackageUpdate>>,
    last_check: Mutex<Option<DateTime<Utc>>>,
}

impl AptMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the upgradable listing and refresh the cache.
    pub fn check_updates(&self) -> Vec<PackageUpdate> {
        debug!("Checking for package updates");
        let output = Command::new("apt")
            .args(["list", "--upgradable"])
            .env("LC_ALL", "C")
            .output();

        let updates = match output {
            Ok(o) if o.status.success() => {
                parse_apt_output(&String::from_utf8_lossy(&o.stdout))
            }
            Ok(o) => {
                warn!(
                    "apt list --upgradable failed: {}",
                    String::from_utf8_lossy(&o.stderr).trim()
                );
                Vec::new()
            }
            Err(e) => {
                warn!("Failed to run apt: {}", e);
                Vec::new()
            }
        };

        let security = updates.iter().filter(|u| u.is_security).count();
        info!("Found {} updates ({} security)", updates.len(), security);

        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = updates.clone();
        *self.last_check.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        updates
    }

    pub fn get_cached_updates(&self) -> Vec<PackageUpdate> {
        self.cached.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn pending_count(&self) -> usize {
        self.cached.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn security_count(&self) -> usize {
        self.cached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|u| u.is_security)
            .count()
    }

    pub fn last_check_time(&self) -> Option<DateTime<Utc>> {
        *self.last_check.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub fn set_cached(&self, updates: Vec<PackageUpdate>) {
        *self.cached.lock().unwrap() = updates;
    }
}

fn parse_apt_output(output: &str) -> Vec<PackageUpdate> {
    let re = apt_line_regex();
    output
        .lines()
        .filter(|line| !line.starts_with("Listing"))
        .filter_map(|line| {
            let caps = re.captures(line)?;
            let source = caps[2].to_string();
            Some(PackageUpdate {
                name: caps[1].to_string(),
                is_security: source.contains("security"),
                source,
                available_version: caps[3].to_string(),
                current_version: caps[4].to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_meminfo_sample() {
        let content = "\
MemTotal:       16384000 kB
MemFree:         1024000 kB
MemAvailable:    8192000 kB
Buffers:          512000 kB
Cached:          4096000 kB
SwapCached:            0 kB
SwapTotal:       2048000 kB
SwapFree:        1024000 kB
";
        let stats = parse_meminfo(content);
        assert_eq!(stats.total_bytes, 16_384_000 * 1024);
        assert_eq!(stats.available_bytes, 8_192_000 * 1024);
        assert_eq!(stats.used_bytes, (16_384_000 - 8_192_000) * 1024);
        assert_eq!(stats.buffers_bytes, 512_000 * 1024);
        assert_eq!(stats.cached_bytes, 4_096_000 * 1024);
        assert_eq!(stats.swap_total_bytes, 2_048_000 * 1024);
        assert_eq!(stats.swap_used_bytes, 1_024_000 * 1024);
        assert!((stats.usage_percent() - 50.0).abs() < 0.01);
    }

    #[test]
    fn parse_meminfo_garbage_is_zeroed() {
        let stats = parse_meminfo("not meminfo at all\n");
        assert_eq!(stats, MemoryStats::default());
        assert_eq!(stats.usage_percent(), 0.0);
    }

    #[test]
    fn parse_cpu_line_sample() {
        // user nice system idle iowait ...
        let usage = parse_cpu_line("cpu  100 50 150 600 100 0 0 0 0 0").unwrap();
        assert!((usage - 30.0).abs() < 0.01);
    }

    #[test]
    fn parse_cpu_line_rejects_bad_input() {
        assert!(parse_cpu_line("cpu0 1 2 3 4 5").is_none());
        assert!(parse_cpu_line("cpu 1 2").is_none());
        assert!(parse_cpu_line("").is_none());
    }

    #[test]
    fn parse_mounts_filters_virtual_and_loop() {
        let content = "\
/dev/sda2 / ext4 rw,relatime 0 0
proc /proc proc rw 0 0
sysfs /sys sysfs rw 0 0
tmpfs /run tmpfs rw 0 0
/dev/loop3 /snap/core/1 squashfs ro 0 0
/dev/nvme0n1p1 /boot vfat rw 0 0
cgroup2 /sys/fs/cgroup cgroup2 rw 0 0
";
        let mounts = parse_mounts(content);
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].mount_point, "/");
        assert_eq!(mounts[0].filesystem, "ext4");
        assert_eq!(mounts[1].mount_point, "/boot");
    }

    #[test]
    fn parse_apt_output_sample() {
        let output = "\
Listing... Done
vim/focal-updates 2:8.2.123-1ubuntu1 amd64 [upgradable from: 2:8.2.100-1]
openssl/focal-security 1.1.1f-1ubuntu2.20 amd64 [upgradable from: 1.1.1f-1ubuntu2.19]
";
        let updates = parse_apt_output(output);
        assert_eq!(updates.len(), 2);

        assert_eq!(updates[0].name, "vim");
        assert_eq!(updates[0].source, "focal-updates");
        assert_eq!(updates[0].available_version, "2:8.2.123-1ubuntu1");
        assert_eq!(updates[0].current_version, "2:8.2.100-1");
        assert!(!updates[0].is_security);

        assert_eq!(updates[1].name, "openssl");
        assert!(updates[1].is_security);

        assert_eq!(
            updates[0].to_string(),
            "vim 2:8.2.100-1 -> 2:8.2.123-1ubuntu1"
        );
    }

    #[test]
    fn parse_apt_output_empty_listing() {
        assert!(parse_apt_output("Listing... Done\n").is_empty());
        assert!(parse_apt_output("").is_empty());
    }

    #[test]
    fn apt_monitor_counts_from_cache() {
        let monitor = AptMonitor::new();
        assert_eq!(monitor.pending_count(), 0);
        assert!(monitor.last_check_time().is_none());

        monitor.set_cached(vec![
            PackageUpdate {
                name: "a".to_string(),
                source: "focal-security".to_string(),
                available_version: "2".to_string(),
                current_version: "1".to_string(),
                is_security: true,
            },
            PackageUpdate {
                name: "b".to_string(),
                source: "focal-updates".to_string(),
                available_version: "2".to_string(),
                current_version: "1".to_string(),
                is_security: false,
            },
        ]);
        assert_eq!(monitor.pending_count(), 2);
        assert_eq!(monitor.security_count(), 1);
    }

    #[test]
    fn read_memory_on_this_host() {
        // Linux only, but so is the daemon.
        let stats = read_memory();
        assert!(stats.total_bytes > 0);
        assert!(stats.used_bytes <= stats.total_bytes);
    }

    #[test]
    fn read_root_disk_on_this_host() {
        let stats = read_root_disk();
        assert_eq!(stats.mount_point, "/");
        assert!(stats.total_bytes > 0);
        assert!(stats.used_bytes <= stats.total_bytes);
    }
}
