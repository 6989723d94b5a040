//! Alert lifecycle management: dedup, persistence, callbacks, retention.
//!
//! The manager owns the store exclusively. One mutex serializes dedup
//! admission with the insert so identical alerts within the window
//! collapse to a single row, and callbacks fire exactly once per admitted
//! alert.

use crate::analysis::AnalysisJob;
use crate::llm::LlmEngine;
use crate::store::AlertStore;
use chrono::{Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use warden_shared::{Alert, AlertSeverity, AlertType};

/// Identical (severity, type, title) within this window collapse to one alert.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(300);

/// Default retention for resolved alerts: one week.
pub const DEFAULT_RETENTION_HOURS: i64 = 168;

const INSERT_ATTEMPTS: usize = 3;

pub type AlertCallback = Box<dyn Fn(&Alert) + Send + Sync>;

struct DedupEntry {
    id: String,
    seen_at: Instant,
}

struct AiHook {
    tx: mpsc::Sender<AnalysisJob>,
    engine: Arc<dyn LlmEngine>,
}

pub struct AlertManager {
    store: AlertStore,
    recent: Mutex<HashMap<String, DedupEntry>>,
    callbacks: Mutex<Vec<AlertCallback>>,
    dedup_window: Duration,
    ai: OnceLock<AiHook>,
}

impl AlertManager {
    pub fn new(store: AlertStore) -> Self {
        Self::with_dedup_window(store, DEFAULT_DEDUP_WINDOW)
    }

    pub fn with_dedup_window(store: AlertStore, dedup_window: Duration) -> Self {
        Self {
            store,
            recent: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            dedup_window,
            ai: OnceLock::new(),
        }
    }

    /// Attach the analysis queue. Without this, `create_smart_alert` still
    /// produces the primary alert and simply skips the analysis pair.
    pub fn enable_ai(&self, tx: mpsc::Sender<AnalysisJob>, engine: Arc<dyn LlmEngine>) {
        if self.ai.set(AiHook { tx, engine }).is_err() {
            warn!("Analysis queue already attached");
        }
    }

    /// Create a new alert, or return the existing id when the same
    /// (severity, type, title) was seen within the dedup window.
    pub fn create(
        &self,
        severity: AlertSeverity,
        alert_type: AlertType,
        title: &str,
        message: &str,
        metadata: HashMap<String, String>,
    ) -> String {
        let (id, _admitted) = self.create_inner(severity, alert_type, title, message, metadata);
        id
    }

    /// Create a threshold alert and, when the engine is loaded, queue a
    /// background analysis that attaches an `ai_analysis` child alert.
    /// The primary alert is visible immediately; nothing here blocks on
    /// inference.
    pub fn create_smart_alert(
        &self,
        severity: AlertSeverity,
        alert_type: AlertType,
        title: &str,
        message: &str,
        context: HashMap<String, String>,
    ) -> String {
        let mut metadata = context.clone();
        metadata.insert("ai_enhanced".to_string(), "pending".to_string());

        let (id, admitted) = self.create_inner(severity, alert_type, title, message, metadata);
        if !admitted {
            return id;
        }

        if let Some(hook) = self.ai.get() {
            if hook.engine.is_loaded() {
                let job = AnalysisJob {
                    parent_id: id.clone(),
                    severity,
                    alert_type,
                    title: title.to_string(),
                    message: message.to_string(),
                    context,
                };
                if let Err(e) = hook.tx.try_send(job) {
                    warn!("Analysis queue rejected job for alert {}: {}", id, e);
                }
            }
        }
        id
    }

    fn create_inner(
        &self,
        severity: AlertSeverity,
        alert_type: AlertType,
        title: &str,
        message: &str,
        metadata: HashMap<String, String>,
    ) -> (String, bool) {
        let key = dedup_key(severity, alert_type, title);
        let now = Instant::now();

        let alert = {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            recent.retain(|_, entry| now.duration_since(entry.seen_at) < self.dedup_window);

            if let Some(entry) = recent.get(&key) {
                debug!("Duplicate alert suppressed: {}", title);
                return (entry.id.clone(), false);
            }

            let mut alert = Alert::new(
                generate_id(),
                severity,
                alert_type,
                title,
                message,
                metadata,
            );

            // An insert can only fail on an id collision or a sick store;
            // retry collisions with a fresh id.
            let mut attempt = 1;
            while !self.store.insert(&alert) {
                if attempt >= INSERT_ATTEMPTS {
                    error!("Giving up inserting alert after {} attempts: {}", attempt, title);
                    break;
                }
                alert.id = generate_id();
                attempt += 1;
            }

            recent.insert(
                key,
                DedupEntry {
                    id: alert.id.clone(),
                    seen_at: now,
                },
            );
            alert
        };

        self.notify_callbacks(&alert);
        (alert.id, true)
    }

    fn notify_callbacks(&self, alert: &Alert) {
        let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        for callback in callbacks.iter() {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(alert)
            }));
            if outcome.is_err() {
                error!("Alert callback panicked for {}", alert.id);
            }
        }
    }

    /// Register a callback invoked synchronously for each new alert.
    pub fn on_alert(&self, callback: AlertCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        let Some(mut alert) = self.store.get(id) else {
            return false;
        };
        alert.acknowledged = true;
        alert.acknowledged_at = Some(Utc::now());
        self.store.update(&alert)
    }

    pub fn resolve(&self, id: &str, resolution: &str) -> bool {
        let Some(mut alert) = self.store.get(id) else {
            return false;
        };
        alert.resolved = true;
        alert.resolved_at = Some(Utc::now());
        if !resolution.is_empty() {
            alert.resolution = Some(resolution.to_string());
        }
        self.store.update(&alert)
    }

    pub fn dismiss(&self, id: &str) -> bool {
        self.store.remove(id)
    }

    /// Acknowledge every active alert; returns how many were updated.
    pub fn acknowledge_all(&self) -> usize {
        self.store
            .get_active()
            .iter()
            .filter(|alert| self.acknowledge(&alert.id))
            .count()
    }

    /// Delete resolved alerts older than `max_age`.
    pub fn cleanup_old(&self, max_age: ChronoDuration) -> usize {
        let deleted = self.store.cleanup_before(Utc::now() - max_age);
        if deleted > 0 {
            debug!("Retention cleanup removed {} alerts", deleted);
        }
        deleted
    }

    pub fn count_active(&self) -> usize {
        self.store.count_active()
    }

    pub fn count_by_severity(&self, severity: AlertSeverity) -> usize {
        self.store.count_by_severity(severity)
    }

    pub fn get_all(&self, limit: i64) -> Vec<Alert> {
        self.store.get_all(limit)
    }

    pub fn get_active(&self) -> Vec<Alert> {
        self.store.get_active()
    }

    pub fn get_by_id(&self, id: &str) -> Option<Alert> {
        self.store.get(id)
    }

    pub fn get_by_severity(&self, severity: AlertSeverity) -> Vec<Alert> {
        self.store.get_by_severity(severity)
    }

    pub fn get_by_type(&self, alert_type: AlertType) -> Vec<Alert> {
        self.store.get_by_type(alert_type)
    }

    /// Every stored alert as a JSON document.
    pub fn export_json(&self) -> serde_json::Value {
        let alerts = self.store.get_all(-1);
        serde_json::json!({
            "count": alerts.len(),
            "alerts": alerts,
        })
    }
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn dedup_key(severity: AlertSeverity, alert_type: AlertType, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(severity.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(alert_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(title.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_manager(window: Duration) -> (tempfile::TempDir, Arc<AlertManager>) {
        let dir = tempfile::tempdir().unwrap();
        let store = AlertStore::open(dir.path().join("alerts.db")).unwrap();
        (dir, Arc::new(AlertManager::with_dedup_window(store, window)))
    }

    #[test]
    fn create_and_fetch() {
        let (_dir, manager) = temp_manager(DEFAULT_DEDUP_WINDOW);
        let id = manager.create(
            AlertSeverity::Warning,
            AlertType::DiskUsage,
            "High disk usage",
            "Disk usage is at 87% on root filesystem",
            HashMap::new(),
        );
        let alert = manager.get_by_id(&id).unwrap();
        assert_eq!(alert.severity, AlertSeverity::Warning);
        assert!(!alert.acknowledged);
        assert_eq!(manager.count_active(), 1);
    }

    #[test]
    fn acknowledge_sets_timestamp() {
        let (_dir, manager) = temp_manager(DEFAULT_DEDUP_WINDOW);
        let id = manager.create(
            AlertSeverity::Error,
            AlertType::MemoryUsage,
            "High memory usage",
            "m",
            HashMap::new(),
        );
        assert!(manager.acknowledge(&id));
        let alert = manager.get_by_id(&id).unwrap();
        assert!(alert.acknowledged);
        assert!(alert.acknowledged_at.is_some());
        assert_eq!(manager.count_active(), 0);
    }

    #[test]
    fn resolve_sets_timestamp_and_resolution() {
        let (_dir, manager) = temp_manager(DEFAULT_DEDUP_WINDOW);
        let id = manager.create(
            AlertSeverity::Warning,
            AlertType::System,
            "t",
            "m",
            HashMap::new(),
        );
        assert!(manager.resolve(&id, "restarted the service"));
        let alert = manager.get_by_id(&id).unwrap();
        assert!(alert.resolved);
        assert!(alert.resolved_at.is_some());
        assert_eq!(alert.resolution.as_deref(), Some("restarted the service"));
    }

    #[test]
    fn lifecycle_ops_on_unknown_id_fail() {
        let (_dir, manager) = temp_manager(DEFAULT_DEDUP_WINDOW);
        assert!(!manager.acknowledge("nope"));
        assert!(!manager.resolve("nope", ""));
        assert!(!manager.dismiss("nope"));
    }

    #[test]
    fn dismiss_removes_from_any_state() {
        let (_dir, manager) = temp_manager(DEFAULT_DEDUP_WINDOW);
        let id = manager.create(
            AlertSeverity::Info,
            AlertType::System,
            "t",
            "m",
            HashMap::new(),
        );
        manager.acknowledge(&id);
        assert!(manager.dismiss(&id));
        assert!(manager.get_by_id(&id).is_none());
    }

    #[test]
    fn duplicate_within_window_returns_same_id() {
        let (_dir, manager) = temp_manager(DEFAULT_DEDUP_WINDOW);
        let first = manager.create(
            AlertSeverity::Warning,
            AlertType::DiskUsage,
            "High disk usage",
            "first",
            HashMap::new(),
        );
        let second = manager.create(
            AlertSeverity::Warning,
            AlertType::DiskUsage,
            "High disk usage",
            "second",
            HashMap::new(),
        );
        assert_eq!(first, second);
        assert_eq!(manager.count_active(), 1);

        // Different title is a different dedup key
        let third = manager.create(
            AlertSeverity::Warning,
            AlertType::DiskUsage,
            "Critical disk usage",
            "third",
            HashMap::new(),
        );
        assert_ne!(first, third);
        assert_eq!(manager.count_active(), 2);
    }

    #[test]
    fn duplicate_after_window_expiry_creates_new_alert() {
        let (_dir, manager) = temp_manager(Duration::from_millis(50));
        let first = manager.create(
            AlertSeverity::Warning,
            AlertType::DiskUsage,
            "High disk usage",
            "m",
            HashMap::new(),
        );
        std::thread::sleep(Duration::from_millis(80));
        let second = manager.create(
            AlertSeverity::Warning,
            AlertType::DiskUsage,
            "High disk usage",
            "m",
            HashMap::new(),
        );
        assert_ne!(first, second);
        assert_eq!(manager.count_active(), 2);
    }

    #[test]
    fn concurrent_creates_yield_unique_ids() {
        const THREADS: usize = 10;
        const PER_THREAD: usize = 50;

        let (_dir, manager) = temp_manager(DEFAULT_DEDUP_WINDOW);
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    let mut ids = Vec::with_capacity(PER_THREAD);
                    for i in 0..PER_THREAD {
                        ids.push(manager.create(
                            AlertSeverity::Info,
                            AlertType::System,
                            &format!("alert {}-{}", t, i),
                            "m",
                            HashMap::new(),
                        ));
                    }
                    ids
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "duplicate alert id issued");
            }
        }
        assert_eq!(all.len(), THREADS * PER_THREAD);
        assert_eq!(manager.count_active(), THREADS * PER_THREAD);
    }

    #[test]
    fn callbacks_fire_once_per_admitted_alert() {
        let (_dir, manager) = temp_manager(DEFAULT_DEDUP_WINDOW);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        manager.on_alert(Box::new(move |_alert| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        manager.create(
            AlertSeverity::Warning,
            AlertType::DiskUsage,
            "High disk usage",
            "m",
            HashMap::new(),
        );
        // Dedup hit: no second callback
        manager.create(
            AlertSeverity::Warning,
            AlertType::DiskUsage,
            "High disk usage",
            "m",
            HashMap::new(),
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_does_not_break_create() {
        let (_dir, manager) = temp_manager(DEFAULT_DEDUP_WINDOW);
        let fired = Arc::new(AtomicUsize::new(0));
        manager.on_alert(Box::new(|_| panic!("callback bug")));
        let counter = Arc::clone(&fired);
        manager.on_alert(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let id = manager.create(
            AlertSeverity::Info,
            AlertType::System,
            "t",
            "m",
            HashMap::new(),
        );
        assert!(manager.get_by_id(&id).is_some());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn acknowledge_all_empties_active_set() {
        let (_dir, manager) = temp_manager(DEFAULT_DEDUP_WINDOW);
        for i in 0..3 {
            manager.create(
                AlertSeverity::Warning,
                AlertType::CpuUsage,
                &format!("alert {}", i),
                "m",
                HashMap::new(),
            );
        }
        assert_eq!(manager.acknowledge_all(), 3);
        assert!(manager.get_active().is_empty());
        for alert in manager.get_all(100) {
            assert!(alert.acknowledged);
            assert!(alert.acknowledged_at.is_some());
        }
    }

    #[test]
    fn cleanup_zero_age_removes_resolved_only() {
        let (_dir, manager) = temp_manager(DEFAULT_DEDUP_WINDOW);
        let resolved = manager.create(
            AlertSeverity::Info,
            AlertType::System,
            "resolved one",
            "m",
            HashMap::new(),
        );
        let active = manager.create(
            AlertSeverity::Info,
            AlertType::System,
            "active one",
            "m",
            HashMap::new(),
        );
        manager.resolve(&resolved, "done");

        // Rows carry whole-second timestamps; step past the creation
        // second so a zero max_age cutoff is strictly newer.
        std::thread::sleep(Duration::from_millis(1100));
        let deleted = manager.cleanup_old(ChronoDuration::zero());
        assert_eq!(deleted, 1);
        assert!(manager.get_by_id(&resolved).is_none());
        assert!(manager.get_by_id(&active).is_some());
    }

    #[test]
    fn export_json_includes_all_rows() {
        let (_dir, manager) = temp_manager(DEFAULT_DEDUP_WINDOW);
        for i in 0..4 {
            manager.create(
                AlertSeverity::Info,
                AlertType::System,
                &format!("alert {}", i),
                "m",
                HashMap::new(),
            );
        }
        manager.acknowledge_all();
        let exported = manager.export_json();
        assert_eq!(exported["count"], 4);
        assert_eq!(exported["alerts"].as_array().unwrap().len(), 4);
    }
}
