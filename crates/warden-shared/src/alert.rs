//! Alert records and their severity/type vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Integer encoding used in the alerts database.
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::Info => 0,
            Self::Warning => 1,
            Self::Error => 2,
            Self::Critical => 3,
        }
    }

    /// Decode the database encoding. Unknown values fall back to `Info`.
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Warning,
            2 => Self::Error,
            3 => Self::Critical,
            _ => Self::Info,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of condition an alert describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    System,
    DiskUsage,
    MemoryUsage,
    CpuUsage,
    SecurityUpdate,
    CveFound,
    AiAnalysis,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::DiskUsage => "disk_usage",
            Self::MemoryUsage => "memory_usage",
            Self::CpuUsage => "cpu_usage",
            Self::SecurityUpdate => "security_update",
            Self::CveFound => "cve_found",
            Self::AiAnalysis => "ai_analysis",
        }
    }

    /// Integer encoding used in the alerts database.
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::System => 0,
            Self::DiskUsage => 1,
            Self::MemoryUsage => 2,
            Self::CpuUsage => 3,
            Self::SecurityUpdate => 4,
            Self::CveFound => 5,
            Self::AiAnalysis => 6,
        }
    }

    /// Decode the database encoding. Unknown values fall back to `System`.
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::DiskUsage,
            2 => Self::MemoryUsage,
            3 => Self::CpuUsage,
            4 => Self::SecurityUpdate,
            5 => Self::CveFound,
            6 => Self::AiAnalysis,
            _ => Self::System,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "disk_usage" => Some(Self::DiskUsage),
            "memory_usage" => Some(Self::MemoryUsage),
            "cpu_usage" => Some(Self::CpuUsage),
            "security_update" => Some(Self::SecurityUpdate),
            "cve_found" => Some(Self::CveFound),
            "ai_analysis" => Some(Self::AiAnalysis),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable record of a noteworthy host condition.
///
/// Invariants maintained by the alert manager: `acknowledged` implies
/// `acknowledged_at` is set, `resolved` implies `resolved_at` is set, and
/// the `id` never changes once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub acknowledged: bool,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl Alert {
    /// A fresh, active alert stamped with the current wall clock.
    pub fn new(
        id: String,
        severity: AlertSeverity,
        alert_type: AlertType,
        title: impl Into<String>,
        message: impl Into<String>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            severity,
            alert_type,
            title: title.into(),
            message: message.into(),
            metadata,
            acknowledged: false,
            resolved: false,
            acknowledged_at: None,
            resolved_at: None,
            resolution: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_roundtrip_db_encoding() {
        for sev in [
            AlertSeverity::Info,
            AlertSeverity::Warning,
            AlertSeverity::Error,
            AlertSeverity::Critical,
        ] {
            assert_eq!(AlertSeverity::from_i64(sev.as_i64()), sev);
            assert_eq!(AlertSeverity::parse(sev.as_str()), Some(sev));
        }
        assert_eq!(AlertSeverity::from_i64(99), AlertSeverity::Info);
    }

    #[test]
    fn type_roundtrip_db_encoding() {
        for ty in [
            AlertType::System,
            AlertType::DiskUsage,
            AlertType::MemoryUsage,
            AlertType::CpuUsage,
            AlertType::SecurityUpdate,
            AlertType::CveFound,
            AlertType::AiAnalysis,
        ] {
            assert_eq!(AlertType::from_i64(ty.as_i64()), ty);
            assert_eq!(AlertType::parse(ty.as_str()), Some(ty));
        }
    }

    #[test]
    fn alert_json_roundtrip() {
        let mut metadata = HashMap::new();
        metadata.insert("usage_percent".to_string(), "96.2".to_string());

        let mut alert = Alert::new(
            "a1b2c3".to_string(),
            AlertSeverity::Critical,
            AlertType::DiskUsage,
            "Critical disk usage",
            "Disk usage is at 96% on root filesystem",
            metadata,
        );
        alert.acknowledged = true;
        alert.acknowledged_at = Some(alert.timestamp);

        let json = serde_json::to_string(&alert).unwrap();
        assert!(json.contains("\"severity\":\"critical\""));
        assert!(json.contains("\"type\":\"disk_usage\""));

        let back: Alert = serde_json::from_str(&json).unwrap();
        assert_eq!(back, alert);
    }

    #[test]
    fn unset_timestamps_omitted_from_json() {
        let alert = Alert::new(
            "x".to_string(),
            AlertSeverity::Info,
            AlertType::System,
            "t",
            "m",
            HashMap::new(),
        );
        let json = serde_json::to_string(&alert).unwrap();
        assert!(!json.contains("acknowledged_at"));
        assert!(!json.contains("resolved_at"));
        assert!(!json.contains("resolution"));
    }
}
