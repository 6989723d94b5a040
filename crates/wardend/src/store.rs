//! SQLite-backed alert storage.
//!
//! One table plus secondary indexes on timestamp, severity, and
//! acknowledged. The store owns its connection exclusively; every
//! operation takes the connection mutex for its duration. Query failures
//! degrade to empty results with a log line so a sick database never
//! takes the daemon down.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, warn};
use warden_shared::{Alert, AlertSeverity, AlertType};

pub struct AlertStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl AlertStore {
    /// Open (or create) the alerts database and initialize the schema.
    ///
    /// Fails cleanly when the file exists but is not a usable database;
    /// the caller decides whether that is fatal.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {:?}", parent))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {:?}", path))?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        store.init_schema()?;
        debug!("Alert store initialized at {:?}", store.db_path);
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                severity INTEGER NOT NULL,
                type INTEGER NOT NULL,
                title TEXT NOT NULL,
                message TEXT,
                metadata TEXT,
                acknowledged INTEGER DEFAULT 0,
                resolved INTEGER DEFAULT 0,
                acknowledged_at INTEGER,
                resolved_at INTEGER,
                resolution TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_timestamp ON alerts(timestamp);
            CREATE INDEX IF NOT EXISTS idx_alerts_severity ON alerts(severity);
            CREATE INDEX IF NOT EXISTS idx_alerts_acknowledged ON alerts(acknowledged);
            "#,
        )
        .context("Failed to create alerts schema")?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a new alert row. False on any failure, including an id
    /// collision (the manager retries those with a fresh id).
    pub fn insert(&self, alert: &Alert) -> bool {
        let metadata =
            serde_json::to_string(&alert.metadata).unwrap_or_else(|_| "{}".to_string());
        let conn = self.lock();
        let result = conn.execute(
            r#"
            INSERT INTO alerts (id, timestamp, severity, type, title, message, metadata,
                                acknowledged, resolved, acknowledged_at, resolved_at, resolution)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                alert.id,
                alert.timestamp.timestamp(),
                alert.severity.as_i64(),
                alert.alert_type.as_i64(),
                alert.title,
                alert.message,
                metadata,
                alert.acknowledged as i64,
                alert.resolved as i64,
                alert.acknowledged_at.map(|t| t.timestamp()).unwrap_or(0),
                alert.resolved_at.map(|t| t.timestamp()).unwrap_or(0),
                alert.resolution.as_deref().unwrap_or(""),
            ],
        );
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to insert alert {}: {}", alert.id, e);
                false
            }
        }
    }

    /// Update the mutable columns of an existing alert.
    pub fn update(&self, alert: &Alert) -> bool {
        let conn = self.lock();
        let result = conn.execute(
            r#"
            UPDATE alerts SET
                acknowledged = ?1,
                resolved = ?2,
                acknowledged_at = ?3,
                resolved_at = ?4,
                resolution = ?5
            WHERE id = ?6
            "#,
            params![
                alert.acknowledged as i64,
                alert.resolved as i64,
                alert.acknowledged_at.map(|t| t.timestamp()).unwrap_or(0),
                alert.resolved_at.map(|t| t.timestamp()).unwrap_or(0),
                alert.resolution.as_deref().unwrap_or(""),
                alert.id,
            ],
        );
        match result {
            Ok(n) => n > 0,
            Err(e) => {
                error!("Failed to update alert {}: {}", alert.id, e);
                false
            }
        }
    }

    /// Delete an alert row.
    pub fn remove(&self, id: &str) -> bool {
        let conn = self.lock();
        match conn.execute("DELETE FROM alerts WHERE id = ?1", params![id]) {
            Ok(n) => n > 0,
            Err(e) => {
                error!("Failed to remove alert {}: {}", id, e);
                false
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Alert> {
        let conn = self.lock();
        let result = conn
            .query_row(
                "SELECT * FROM alerts WHERE id = ?1",
                params![id],
                row_to_alert,
            )
            .optional();
        match result {
            Ok(alert) => alert,
            Err(e) => {
                error!("Failed to fetch alert {}: {}", id, e);
                None
            }
        }
    }

    /// All alerts, newest first. A negative limit means no cap.
    pub fn get_all(&self, limit: i64) -> Vec<Alert> {
        self.query(
            "SELECT * FROM alerts ORDER BY timestamp DESC LIMIT ?1",
            params![limit],
        )
    }

    /// Unacknowledged alerts, newest first.
    pub fn get_active(&self) -> Vec<Alert> {
        self.query(
            "SELECT * FROM alerts WHERE acknowledged = 0 ORDER BY timestamp DESC",
            params![],
        )
    }

    /// Unacknowledged alerts of one severity, newest first.
    pub fn get_by_severity(&self, severity: AlertSeverity) -> Vec<Alert> {
        self.query(
            "SELECT * FROM alerts WHERE severity = ?1 AND acknowledged = 0 ORDER BY timestamp DESC",
            params![severity.as_i64()],
        )
    }

    /// Unacknowledged alerts of one type, newest first.
    pub fn get_by_type(&self, alert_type: AlertType) -> Vec<Alert> {
        self.query(
            "SELECT * FROM alerts WHERE type = ?1 AND acknowledged = 0 ORDER BY timestamp DESC",
            params![alert_type.as_i64()],
        )
    }

    pub fn count_active(&self) -> usize {
        self.count("SELECT COUNT(*) FROM alerts WHERE acknowledged = 0", params![])
    }

    pub fn count_by_severity(&self, severity: AlertSeverity) -> usize {
        self.count(
            "SELECT COUNT(*) FROM alerts WHERE severity = ?1 AND acknowledged = 0",
            params![severity.as_i64()],
        )
    }

    /// Delete resolved alerts older than the cutoff. Unresolved rows are
    /// kept regardless of age.
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> usize {
        let conn = self.lock();
        match conn.execute(
            "DELETE FROM alerts WHERE timestamp < ?1 AND resolved = 1",
            params![cutoff.timestamp()],
        ) {
            Ok(n) => n,
            Err(e) => {
                error!("Alert cleanup failed: {}", e);
                0
            }
        }
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Vec<Alert> {
        let conn = self.lock();
        let run = || -> rusqlite::Result<Vec<Alert>> {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, row_to_alert)?;
            rows.collect()
        };
        match run() {
            Ok(alerts) => alerts,
            Err(e) => {
                error!("Alert query failed: {}", e);
                Vec::new()
            }
        }
    }

    fn count(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> usize {
        let conn = self.lock();
        match conn.query_row(sql, params, |row| row.get::<_, i64>(0)) {
            Ok(n) => n.max(0) as usize,
            Err(e) => {
                error!("Alert count failed: {}", e);
                0
            }
        }
    }
}

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<Alert> {
    // Metadata is stored as a JSON object; unparseable values degrade to
    // an empty map rather than failing the whole row.
    let metadata: HashMap<String, String> = row
        .get::<_, Option<String>>(6)?
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    let ack_at: i64 = row.get::<_, Option<i64>>(9)?.unwrap_or(0);
    let res_at: i64 = row.get::<_, Option<i64>>(10)?.unwrap_or(0);
    let resolution: String = row.get::<_, Option<String>>(11)?.unwrap_or_default();

    Ok(Alert {
        id: row.get(0)?,
        timestamp: Utc
            .timestamp_opt(row.get(1)?, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        severity: AlertSeverity::from_i64(row.get(2)?),
        alert_type: AlertType::from_i64(row.get(3)?),
        title: row.get(4)?,
        message: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        metadata,
        acknowledged: row.get::<_, i64>(7)? != 0,
        resolved: row.get::<_, i64>(8)? != 0,
        acknowledged_at: (ack_at > 0).then(|| Utc.timestamp_opt(ack_at, 0).single()).flatten(),
        resolved_at: (res_at > 0).then(|| Utc.timestamp_opt(res_at, 0).single()).flatten(),
        resolution: (!resolution.is_empty()).then_some(resolution),
    })
}
