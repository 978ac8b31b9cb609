//! Core types for Meshtask

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::{now_millis, ClockToken};
use crate::error::{MeshError, MeshResult};

/// Number of leading peer-id characters used as the author tag on records
pub const AUTHOR_TAG_LEN: usize = 8;

const PEER_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Identifier of a peer in the mesh
///
/// Opaque string; identifier order decides the initiator of a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier of the form `peer-<5 base36>-<epoch ms>`
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let suffix: String = (0..5)
            .map(|_| PEER_ALPHABET[rng.random_range(0..PEER_ALPHABET.len())] as char)
            .collect();
        Self(format!("peer-{}-{}", suffix, now_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short author tag stamped into `createdBy`/`doneBy`
    pub fn author_tag(&self) -> String {
        self.0.chars().take(AUTHOR_TAG_LEN).collect()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Generate a new globally unique record id
///
/// Uses ULID so ids sort by creation time.
pub fn new_record_id() -> String {
    Ulid::new().to_string()
}

/// Kind tag carried by stored values; only tasks are managed by the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    #[default]
    Task,
    #[serde(other)]
    Other,
}

/// Completion status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Complete,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::Pending => write!(f, "pending"),
            RecordStatus::Complete => write!(f, "complete"),
        }
    }
}

/// Descriptive priority, not used in resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// One entry of a record's advisory audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the action happened (epoch millis)
    pub at: i64,
    /// Author tag of the acting peer
    pub by: String,
    /// `create`, `status` or `delete`
    pub action: String,
    /// State before the action
    pub from: Option<String>,
    /// State after the action
    pub to: Option<String>,
}

impl HistoryEntry {
    pub fn new(
        at: i64,
        by: impl Into<String>,
        action: impl Into<String>,
        from: Option<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            at,
            by: by.into(),
            action: action.into(),
            from,
            to: Some(to.into()),
        }
    }
}

/// A shared task record
///
/// The whole record is the unit of conflict resolution: `clock` alone decides
/// which of two versions of the same `id` wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub done_at: Option<i64>,
    #[serde(default)]
    pub done_by: Option<String>,
    #[serde(default)]
    pub created_by: String,
    pub clock: ClockToken,
    #[serde(default)]
    pub deleted: bool,
    #[serde(rename = "type", default)]
    pub kind: RecordKind,
    #[serde(default)]
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Fields written by other clients, carried through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    /// Create a new pending task authored by `author` and stamped with `clock`
    pub fn new_task(text: impl Into<String>, author: &PeerId, clock: ClockToken) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let by = author.author_tag();
        Self {
            id: new_record_id(),
            text: text.into(),
            created_at: now,
            updated_at: now,
            done_at: None,
            done_by: None,
            created_by: by.clone(),
            clock,
            deleted: false,
            kind: RecordKind::Task,
            status: Some(RecordStatus::Pending),
            priority: Some(Priority::Medium),
            assignee: Some(by.clone()),
            history: vec![HistoryEntry::new(now, by, "create", None, "pending")],
            extra: serde_json::Map::new(),
        }
    }

    /// Minimal tombstone for an id this peer has never stored
    pub fn tombstone(id: impl Into<String>, clock: ClockToken) -> Self {
        Self {
            id: id.into(),
            text: String::new(),
            created_at: 0,
            updated_at: 0,
            done_at: None,
            done_by: None,
            created_by: String::new(),
            clock,
            deleted: true,
            kind: RecordKind::Task,
            status: None,
            priority: None,
            assignee: None,
            history: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Decode a record from a wire value.
    ///
    /// A missing or null `clock` is reported separately from other parse
    /// failures so callers can drop such records without further processing.
    pub fn from_wire(value: &serde_json::Value) -> MeshResult<Self> {
        let id = value
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        match value.get("clock") {
            None | Some(serde_json::Value::Null) => return Err(MeshError::MissingClock(id)),
            Some(_) => {}
        }
        serde_json::from_value(value.clone()).map_err(|e| MeshError::Malformed(e.to_string()))
    }

    /// Encode for the wire
    pub fn to_wire(&self) -> MeshResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Status, derived from `done_at` when not recorded
    pub fn effective_status(&self) -> RecordStatus {
        self.status.unwrap_or(if self.done_at.is_some() {
            RecordStatus::Complete
        } else {
            RecordStatus::Pending
        })
    }

    pub fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }

    pub fn is_done(&self) -> bool {
        self.done_at.is_some()
    }

    /// Mark complete with a fresh clock
    pub fn complete(&mut self, author: &PeerId, clock: ClockToken) {
        let now = chrono::Utc::now().timestamp_millis();
        let by = author.author_tag();
        let prev = self.effective_status();
        self.done_at = Some(now);
        self.done_by = Some(by.clone());
        self.updated_at = now;
        self.clock = clock;
        self.deleted = false;
        self.status = Some(RecordStatus::Complete);
        self.history.push(HistoryEntry::new(
            now,
            by,
            "status",
            Some(prev.to_string()),
            "complete",
        ));
    }

    /// Turn into a tombstone with a fresh clock
    pub fn mark_deleted(&mut self, author: &PeerId, clock: ClockToken) {
        let now = chrono::Utc::now().timestamp_millis();
        let from = self.status.map(|s| s.to_string());
        self.deleted = true;
        self.clock = clock;
        self.updated_at = now;
        self.history
            .push(HistoryEntry::new(now, author.author_tag(), "delete", from, "deleted"));
    }

    /// Normalized copy with defaults filled in, as exported in snapshots
    pub fn exported(&self) -> Self {
        let mut out = self.clone();
        out.kind = RecordKind::Task;
        out.status = Some(self.effective_status());
        out.priority = Some(self.effective_priority());
        out
    }
}
