//! Daemon configuration.
//!
//! Loads settings from /etc/warden/config.toml or uses defaults. Every
//! field has a serde default so partial files work.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/warden/config.toml";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Control socket path
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Alerts database path
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Default model for the inference engine
    #[serde(default = "default_model_path")]
    pub model_path: String,

    /// Context window passed to the engine
    #[serde(default = "default_llm_context_length")]
    pub llm_context_length: u32,

    /// Inference threads requested from the engine
    #[serde(default = "default_llm_threads")]
    pub llm_threads: u32,

    /// Seconds between monitor sample passes
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_sec: u64,

    /// Log filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Disk usage warning threshold, fraction in [0,1]
    #[serde(default = "default_disk_warn")]
    pub disk_warn_threshold: f64,

    /// Disk usage critical threshold, fraction in [0,1]
    #[serde(default = "default_disk_crit")]
    pub disk_crit_threshold: f64,

    /// Memory usage warning threshold, fraction in [0,1]
    #[serde(default = "default_mem_warn")]
    pub mem_warn_threshold: f64,

    /// Memory usage critical threshold, fraction in [0,1]
    #[serde(default = "default_mem_crit")]
    pub mem_crit_threshold: f64,

    /// Gate for the apt update check
    #[serde(default = "default_enable_apt_monitor")]
    pub enable_apt_monitor: bool,

    /// Gate for the CVE scan
    #[serde(default)]
    pub enable_cve_scan: bool,

    /// Gate for the AI analysis alert path
    #[serde(default = "default_enable_ai_alerts")]
    pub enable_ai_alerts: bool,

    /// Control-socket requests admitted per second
    #[serde(default = "default_max_requests_per_sec")]
    pub max_requests_per_sec: u32,
}

fn default_socket_path() -> String {
    "/run/warden/warden.sock".to_string()
}

fn default_db_path() -> String {
    // System path when the daemon runs as a service, user state dir otherwise.
    let system = Path::new("/var/lib/warden");
    if system.exists() {
        return "/var/lib/warden/alerts.db".to_string();
    }
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("warden")
        .join("alerts.db")
        .to_string_lossy()
        .into_owned()
}

fn default_model_path() -> String {
    "qwen2.5:0.5b-instruct".to_string()
}

fn default_llm_context_length() -> u32 {
    4096
}

fn default_llm_threads() -> u32 {
    4
}

fn default_monitor_interval() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_disk_warn() -> f64 {
    0.85
}

fn default_disk_crit() -> f64 {
    0.95
}

fn default_mem_warn() -> f64 {
    0.85
}

fn default_mem_crit() -> f64 {
    0.95
}

fn default_enable_apt_monitor() -> bool {
    true
}

fn default_enable_ai_alerts() -> bool {
    true
}

fn default_max_requests_per_sec() -> u32 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            db_path: default_db_path(),
            model_path: default_model_path(),
            llm_context_length: default_llm_context_length(),
            llm_threads: default_llm_threads(),
            monitor_interval_sec: default_monitor_interval(),
            log_level: default_log_level(),
            disk_warn_threshold: default_disk_warn(),
            disk_crit_threshold: default_disk_crit(),
            mem_warn_threshold: default_mem_warn(),
            mem_crit_threshold: default_mem_crit(),
            enable_apt_monitor: default_enable_apt_monitor(),
            enable_cve_scan: false,
            enable_ai_alerts: default_enable_ai_alerts(),
            max_requests_per_sec: default_max_requests_per_sec(),
        }
    }
}

impl Config {
    /// Load config from the default path, or return defaults.
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_PATH).unwrap_or_else(|e| {
            warn!("Config not found, using defaults: {}", e);
            Config::default()
        })
    }

    /// Load config from a specific path.
    pub fn load_from_path(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded config from {}", path);
        Ok(config)
    }
}

/// Shared, reloadable view of the config, passed explicitly to components.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Config>>,
    path: Arc<str>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            path: Arc::from(CONFIG_PATH),
        }
    }

    pub fn with_path(config: Config, path: &str) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            path: Arc::from(path),
        }
    }

    /// Current config by value, so callers never hold the lock.
    pub fn get(&self) -> Config {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Re-read the config file and replace the shared view.
    pub fn reload(&self) -> Result<()> {
        let fresh = Config::load_from_path(&self.path)?;
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        info!("Configuration reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.monitor_interval_sec, 300);
        assert_eq!(config.disk_crit_threshold, 0.95);
        assert_eq!(config.max_requests_per_sec, 10);
        assert!(config.enable_apt_monitor);
        assert!(!config.enable_cve_scan);
    }

    #[test]
    fn parse_partial_toml() {
        let toml_str = r#"
socket_path = "/tmp/test.sock"
monitor_interval_sec = 60
disk_crit_threshold = 0.90
enable_apt_monitor = false
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.socket_path, "/tmp/test.sock");
        assert_eq!(config.monitor_interval_sec, 60);
        assert_eq!(config.disk_crit_threshold, 0.90);
        assert!(!config.enable_apt_monitor);
        // Defaults for missing fields
        assert_eq!(config.mem_crit_threshold, 0.95);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn handle_reload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "monitor_interval_sec = 120\n").unwrap();

        let handle = ConfigHandle::with_path(Config::default(), path.to_str().unwrap());
        assert_eq!(handle.get().monitor_interval_sec, 300);

        handle.reload().unwrap();
        assert_eq!(handle.get().monitor_interval_sec, 120);
    }

    #[test]
    fn handle_reload_missing_file_fails() {
        let handle = ConfigHandle::with_path(Config::default(), "/nonexistent/config.toml");
        assert!(handle.reload().is_err());
    }
}
