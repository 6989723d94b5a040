//! Periodic health sampling and threshold-driven alerting.
//!
//! One dedicated worker runs a sample pass immediately on start, then
//! every `monitor_interval_sec` (or sooner on a manual trigger), sleeping
//! in one-second slices so shutdown stays prompt. Snapshots publish under
//! a mutex; readers always get a whole copy.

use crate::alerts::AlertManager;
use crate::collectors::{self, AptMonitor};
use crate::config::ConfigHandle;
use crate::cve::CveScanner;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use warden_shared::{AlertSeverity, AlertType, HealthSnapshot};

/// Package and CVE checks run on every Nth sample pass.
const SUBSAMPLE_EVERY: u64 = 5;

/// Listed items in alert metadata before the "...and N more" tail.
const METADATA_LIST_LIMIT: usize = 5;

pub struct SystemMonitor {
    alerts: Arc<AlertManager>,
    config: ConfigHandle,
    apt: AptMonitor,
    cve: CveScanner,
    snapshot: Mutex<HealthSnapshot>,
    running: AtomicBool,
    check_requested: AtomicBool,
    /// Shared by the loop and `force_check`, so a forced pass advances
    /// the subsample divisor exactly once.
    pass_counter: AtomicU64,
    llm_loaded: AtomicBool,
    llm_queue_size: AtomicUsize,
    llm_model_name: Mutex<String>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SystemMonitor {
    pub fn new(alerts: Arc<AlertManager>, config: ConfigHandle) -> Self {
        Self {
            alerts,
            config,
            apt: AptMonitor::new(),
            cve: CveScanner::new(),
            snapshot: Mutex::new(HealthSnapshot::default()),
            running: AtomicBool::new(false),
            check_requested: AtomicBool::new(false),
            pass_counter: AtomicU64::new(0),
            llm_loaded: AtomicBool::new(false),
            llm_queue_size: AtomicUsize::new(0),
            llm_model_name: Mutex::new(String::new()),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the sampling worker. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let monitor = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("warden-monitor".to_string())
            .spawn(move || monitor.run_loop());
        match spawned {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                info!(
                    "Monitor started with {}s interval",
                    self.config.get().monitor_interval_sec
                );
            }
            Err(e) => {
                error!("Failed to spawn monitor worker: {}", e);
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Stop the worker; returns once the loop has exited.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        info!("Monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current snapshot by value; never blocks on a sample pass.
    pub fn get_snapshot(&self) -> HealthSnapshot {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Ask the worker to sample on its next one-second tick.
    pub fn trigger_check(&self) {
        self.check_requested.store(true, Ordering::SeqCst);
    }

    /// Run a full sample pass on the calling thread and return the
    /// resulting snapshot.
    pub fn force_check(&self) -> HealthSnapshot {
        debug!("Running forced health check");
        self.run_pass();
        self.get_snapshot()
    }

    /// Mirror externally-managed LLM state into future snapshots.
    pub fn set_llm_state(&self, loaded: bool, model_name: &str, queue_size: usize) {
        self.llm_loaded.store(loaded, Ordering::SeqCst);
        self.llm_queue_size.store(queue_size, Ordering::SeqCst);
        *self.llm_model_name.lock().unwrap_or_else(|e| e.into_inner()) = model_name.to_string();
    }

    /// Pending updates from the last package check, rendered for clients.
    pub fn get_pending_updates(&self) -> Vec<String> {
        self.apt
            .get_cached_updates()
            .iter()
            .map(|u| u.to_string())
            .collect()
    }

    fn run_loop(&self) {
        debug!("Monitor loop started");
        self.run_pass();
        let mut last_check = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(1));

            let interval = Duration::from_secs(self.config.get().monitor_interval_sec);
            let requested = self.check_requested.load(Ordering::SeqCst);
            if last_check.elapsed() >= interval || requested {
                self.check_requested.store(false, Ordering::SeqCst);
                self.run_pass();
                last_check = Instant::now();
            }
        }
        debug!("Monitor loop ended");
    }

    fn run_pass(&self) {
        let pass = self.pass_counter.fetch_add(1, Ordering::SeqCst);
        let config = self.config.get();

        let memory = collectors::read_memory();
        let disk = collectors::read_root_disk();
        let cpu = collectors::read_cpu_usage();

        let (pending, security) = if config.enable_apt_monitor {
            if pass % SUBSAMPLE_EVERY == 0 {
                self.apt.check_updates();
            }
            (self.apt.pending_count(), self.apt.security_count())
        } else {
            (0, 0)
        };

        if config.enable_cve_scan && pass % SUBSAMPLE_EVERY == 0 {
            self.cve.scan();
        }

        let snapshot = {
            let mut current = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
            *current = HealthSnapshot {
                timestamp: Utc::now(),
                cpu_usage_percent: cpu,
                memory_usage_percent: memory.usage_percent(),
                memory_used_mb: memory.used_mb(),
                memory_total_mb: memory.total_mb(),
                disk_usage_percent: disk.usage_percent(),
                disk_used_gb: disk.used_gb(),
                disk_total_gb: disk.total_gb(),
                pending_updates: pending,
                security_updates: security,
                llm_loaded: self.llm_loaded.load(Ordering::SeqCst),
                llm_model_name: self
                    .llm_model_name
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone(),
                inference_queue_size: self.llm_queue_size.load(Ordering::SeqCst),
                active_alerts: self.alerts.count_active(),
                critical_alerts: self.alerts.count_by_severity(AlertSeverity::Critical),
            };
            current.clone()
        };

        self.evaluate_thresholds(&snapshot);

        debug!(
            "Health check complete: CPU={:.1}%, MEM={:.1}%, DISK={:.1}%",
            snapshot.cpu_usage_percent,
            snapshot.memory_usage_percent,
            snapshot.disk_usage_percent
        );
    }

    /// Compare a snapshot against configured thresholds and emit alerts.
    /// Dedup in the manager keeps repeated passes from stacking rows.
    pub fn evaluate_thresholds(&self, snapshot: &HealthSnapshot) {
        let config = self.config.get();

        let disk_fraction = snapshot.disk_usage_percent / 100.0;
        if disk_fraction >= config.disk_crit_threshold {
            self.alerts.create_smart_alert(
                AlertSeverity::Critical,
                AlertType::DiskUsage,
                "Critical disk usage",
                &format!(
                    "Disk usage is at {:.0}% on root filesystem",
                    snapshot.disk_usage_percent
                ),
                usage_context(snapshot.disk_usage_percent),
            );
        } else if disk_fraction >= config.disk_warn_threshold {
            self.alerts.create_smart_alert(
                AlertSeverity::Warning,
                AlertType::DiskUsage,
                "High disk usage",
                &format!(
                    "Disk usage is at {:.0}% on root filesystem",
                    snapshot.disk_usage_percent
                ),
                usage_context(snapshot.disk_usage_percent),
            );
        }

        let memory_fraction = snapshot.memory_usage_percent / 100.0;
        if memory_fraction >= config.mem_crit_threshold {
            self.alerts.create_smart_alert(
                AlertSeverity::Critical,
                AlertType::MemoryUsage,
                "Critical memory usage",
                &format!("Memory usage is at {:.0}%", snapshot.memory_usage_percent),
                usage_context(snapshot.memory_usage_percent),
            );
        } else if memory_fraction >= config.mem_warn_threshold {
            self.alerts.create_smart_alert(
                AlertSeverity::Warning,
                AlertType::MemoryUsage,
                "High memory usage",
                &format!("Memory usage is at {:.0}%", snapshot.memory_usage_percent),
                usage_context(snapshot.memory_usage_percent),
            );
        }

        if snapshot.security_updates > 0 {
            let mut context = HashMap::new();
            context.insert("count".to_string(), snapshot.security_updates.to_string());
            context.insert(
                "updates".to_string(),
                truncate_list(
                    self.apt
                        .get_cached_updates()
                        .iter()
                        .filter(|u| u.is_security)
                        .map(|u| u.to_string()),
                ),
            );
            self.alerts.create_smart_alert(
                AlertSeverity::Warning,
                AlertType::SecurityUpdate,
                "Security updates available",
                &format!(
                    "{} security update(s) available",
                    snapshot.security_updates
                ),
                context,
            );
        }

        let urgent_cves = self.cve.urgent_findings();
        if !urgent_cves.is_empty() {
            let mut context = HashMap::new();
            context.insert("count".to_string(), urgent_cves.len().to_string());
            context.insert(
                "cves".to_string(),
                truncate_list(urgent_cves.iter().map(|f| f.to_string())),
            );
            self.alerts.create_smart_alert(
                AlertSeverity::Warning,
                AlertType::CveFound,
                "Known vulnerabilities detected",
                &format!(
                    "{} known vulnerability(ies) affect installed packages",
                    urgent_cves.len()
                ),
                context,
            );
        }
    }
}

fn usage_context(percent: f64) -> HashMap<String, String> {
    let mut context = HashMap::new();
    context.insert("usage_percent".to_string(), format!("{:.1}", percent));
    context
}

/// Join items, keeping the first few and summarizing the rest.
fn truncate_list(items: impl Iterator<Item = String>) -> String {
    let items: Vec<String> = items.collect();
    if items.len() <= METADATA_LIST_LIMIT {
        return items.join(", ");
    }
    let shown = items[..METADATA_LIST_LIMIT].join(", ");
    format!("{}, ...and {} more", shown, items.len() - METADATA_LIST_LIMIT)
}
