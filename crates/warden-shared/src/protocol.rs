//! Request/response protocol for the control socket.
//!
//! One UTF-8 JSON request, one JSON response per connection. Requests
//! larger than [`MAX_MESSAGE_SIZE`] are rejected at the framing layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Maximum accepted request size in bytes (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Method names accepted by the daemon.
pub mod methods {
    pub const PING: &str = "ping";
    pub const VERSION: &str = "version";
    pub const STATUS: &str = "status";
    pub const HEALTH: &str = "health";
    pub const ALERTS: &str = "alerts";
    pub const ALERTS_GET: &str = "alerts.get";
    pub const ALERTS_ACK: &str = "alerts.ack";
    pub const ALERTS_DISMISS: &str = "alerts.dismiss";
    pub const CONFIG_GET: &str = "config.get";
    pub const CONFIG_RELOAD: &str = "config.reload";
    pub const LLM_STATUS: &str = "llm.status";
    pub const LLM_LOAD: &str = "llm.load";
    pub const LLM_UNLOAD: &str = "llm.unload";
    pub const LLM_INFER: &str = "llm.infer";
    pub const SHUTDOWN: &str = "shutdown";
}

/// Structured error codes carried in failure responses.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const RATE_LIMITED: i32 = -32010;
    pub const ALERT_NOT_FOUND: i32 = -32020;
    pub const LLM_NOT_LOADED: i32 = -32030;
    pub const CONFIG_ERROR: i32 = -32040;
}

/// A single control-plane request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: HashMap::new(),
            id: None,
        }
    }

    /// Parse a raw frame. Fails on malformed JSON, a missing `method`
    /// field, or frames over the size cap.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.is_empty() || raw.len() > MAX_MESSAGE_SIZE {
            return None;
        }
        serde_json::from_slice(raw).ok()
    }

    /// Fetch a string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Fetch an integer parameter.
    pub fn param_i64(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(Value::as_i64)
    }

    /// Fetch a float parameter (integers coerce).
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(Value::as_f64)
    }

    /// Fetch a boolean parameter.
    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }
}

/// A single control-plane response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
            id: None,
        }
    }

    pub fn err(message: impl Into<String>, code: i32) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            code: Some(code),
            id: None,
        }
    }

    /// Echo the request id, when present.
    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // A Response is always serializable; fall back to a bare failure
        // if that ever changes.
        serde_json::to_vec(self).unwrap_or_else(|_| b"{\"success\":false}".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_minimal_request() {
        let req = Request::parse(br#"{"method":"ping"}"#).unwrap();
        assert_eq!(req.method, "ping");
        assert!(req.params.is_empty());
        assert!(req.id.is_none());
    }

    #[test]
    fn parse_request_with_params_and_id() {
        let raw = br#"{"method":"alerts","params":{"severity":"critical","limit":10},"id":"req-7"}"#;
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.param_str("severity"), Some("critical"));
        assert_eq!(req.param_i64("limit"), Some(10));
        assert_eq!(req.id.as_deref(), Some("req-7"));
    }

    #[test]
    fn parse_rejects_garbage_and_missing_method() {
        assert!(Request::parse(b"not json").is_none());
        assert!(Request::parse(b"").is_none());
        assert!(Request::parse(br#"{"params":{}}"#).is_none());
    }

    #[test]
    fn parse_rejects_oversized_frame() {
        let mut raw = br#"{"method":"ping","params":{"pad":""#.to_vec();
        raw.extend(std::iter::repeat(b'x').take(MAX_MESSAGE_SIZE));
        raw.extend_from_slice(br#""}}"#);
        assert!(Request::parse(&raw).is_none());
    }

    #[test]
    fn response_serialization() {
        let resp = Response::ok(json!({"pong": true})).with_id(Some("1".to_string()));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"id\":\"1\""));
        assert!(!json.contains("error"));

        let resp = Response::err("Method not found: bogus", error_codes::METHOD_NOT_FOUND);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"code\":-32601"));
        assert!(!json.contains("data"));
    }
}
