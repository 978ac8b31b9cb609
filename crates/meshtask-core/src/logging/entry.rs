//! Log entry types for JSONL logging

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of a peer's JSONL log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLogEntry {
    /// RFC 3339 timestamp with millisecond precision
    pub ts: String,

    /// trace, debug, info, warn or error
    pub level: String,

    /// Author tag of the peer that wrote the entry
    pub peer: String,

    /// Module path the event came from (e.g. "meshtask_core::sync::gossip")
    pub target: String,

    pub msg: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Enclosing spans, outermost first, joined with " > "
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl JsonLogEntry {
    pub fn new(
        level: impl Into<String>,
        peer: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            peer: peer.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Structured field as a string, if present
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.as_ref()?.get(name)?.as_str()
    }
}

/// Written once per run so logs of peers started together can be matched up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub started_at: String,
    /// Author tags of the peers in this session
    pub peers: Vec<String>,
    /// Relay the peers signaled through
    pub relay: Option<String>,
    pub cwd: Option<String>,
}

impl SessionMetadata {
    pub fn new(peers: Vec<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            session_id: now.format("%Y-%m-%dT%H-%M-%S").to_string(),
            started_at: now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            peers,
            relay: None,
            cwd: std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string()),
        }
    }

    pub fn with_relay(mut self, relay: impl Into<String>) -> Self {
        self.relay = Some(relay.into());
        self
    }
}
