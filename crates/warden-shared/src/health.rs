//! The health snapshot published by the monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One atomically-published bundle of host metrics.
///
/// The default value carries an epoch timestamp and is what readers see
/// until the first sample pass completes; `is_empty` detects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub disk_usage_percent: f64,
    pub disk_used_gb: f64,
    pub disk_total_gb: f64,
    pub pending_updates: usize,
    pub security_updates: usize,
    pub llm_loaded: bool,
    pub llm_model_name: String,
    pub inference_queue_size: usize,
    pub active_alerts: usize,
    pub critical_alerts: usize,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            cpu_usage_percent: 0.0,
            memory_usage_percent: 0.0,
            memory_used_mb: 0,
            memory_total_mb: 0,
            disk_usage_percent: 0.0,
            disk_used_gb: 0.0,
            disk_total_gb: 0.0,
            pending_updates: 0,
            security_updates: 0,
            llm_loaded: false,
            llm_model_name: String::new(),
            inference_queue_size: 0,
            active_alerts: 0,
            critical_alerts: 0,
        }
    }
}

impl HealthSnapshot {
    /// True until the monitor has completed its first sample pass.
    pub fn is_empty(&self) -> bool {
        self.timestamp == DateTime::<Utc>::UNIX_EPOCH
    }
}
