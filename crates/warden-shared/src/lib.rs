//! Shared types for warden: alert records, health snapshots, and the
//! unix-socket request/response protocol.
//!
//! Everything here is plain data. The daemon (`wardend`) and any co-located
//! client link this crate so both sides agree on the wire format.

pub mod alert;
pub mod health;
pub mod protocol;

pub use alert::{Alert, AlertSeverity, AlertType};
pub use health::HealthSnapshot;
pub use protocol::{Request, Response};

/// Daemon version, from the workspace manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Daemon name as reported by the `version` method.
pub const NAME: &str = "warden";
