//! Gossip wire protocol exchanged over peer links
//!
//! Every payload is a self-contained JSON object tagged by `t`.
//!
//! ## Message Flow
//!
//! ```text
//! Peer A                              Peer B
//!   |                                   |
//!   |--- hello {maxClock} ------------->|   (first frame on an open link)
//!   |<-- helloReply {maxClock} ---------|
//!   |                                   |
//!   |    (A is empty or behind B)       |
//!   |                                   |
//!   |--- snapshot:request ------------->|
//!   |<-- snapshot {docs} ---------------|
//!   |                                   |
//!   |<-- doc {doc} ---------------------|   (flooded edits, deduplicated)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::ClockToken;
use crate::error::{MeshError, MeshResult};
use crate::types::{PeerId, Record};

fn is_false(b: &bool) -> bool {
    !*b
}

/// Messages sent over peer links
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum WireMessage {
    /// Announce the sender's highest known clock
    ///
    /// Sent once a link opens, and addressed to each peer on manual resync.
    #[serde(rename = "hello", rename_all = "camelCase")]
    Hello {
        from: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        max_clock: ClockToken,
    },

    /// Symmetric answer to `hello`
    #[serde(rename = "helloReply", rename_all = "camelCase")]
    HelloReply {
        from: PeerId,
        to: PeerId,
        max_clock: ClockToken,
    },

    /// Propagate one record
    ///
    /// The record stays a raw JSON value so forwarding preserves fields this
    /// peer does not know about.
    #[serde(rename = "doc")]
    Doc {
        doc: Value,
        #[serde(default, skip_serializing_if = "is_false")]
        silent: bool,
    },

    /// Ask a peer for its full state
    #[serde(rename = "snapshot:request")]
    SnapshotRequest { from: PeerId, to: PeerId },

    /// Full-state payload answering a snapshot request
    #[serde(rename = "snapshot")]
    Snapshot {
        from: PeerId,
        to: PeerId,
        docs: Vec<Value>,
    },

    /// Administrative reset: every receiver wipes its local store
    #[serde(rename = "clear:all")]
    ClearAll {
        from: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
    },

    /// Any message kind this peer does not understand
    #[serde(other)]
    Unknown,
}

impl WireMessage {
    /// Build a `doc` message for a record
    pub fn doc(record: &Record, silent: bool) -> MeshResult<Self> {
        Ok(WireMessage::Doc {
            doc: record.to_wire()?,
            silent,
        })
    }

    /// Build a `snapshot` message carrying `records`
    pub fn snapshot(from: PeerId, to: PeerId, records: &[Record]) -> MeshResult<Self> {
        let docs = records
            .iter()
            .map(Record::to_wire)
            .collect::<MeshResult<Vec<_>>>()?;
        Ok(WireMessage::Snapshot { from, to, docs })
    }

    /// Encode to a JSON text frame
    pub fn encode(&self) -> MeshResult<String> {
        serde_json::to_string(self).map_err(|e| MeshError::Serialization(e.to_string()))
    }

    /// Decode a JSON text frame
    pub fn decode(raw: &str) -> MeshResult<Self> {
        serde_json::from_str(raw).map_err(|e| MeshError::Malformed(e.to_string()))
    }

    /// Addressee, for the kinds that carry one
    pub fn to(&self) -> Option<&PeerId> {
        match self {
            WireMessage::Hello { to, .. } | WireMessage::ClearAll { to, .. } => to.as_ref(),
            WireMessage::HelloReply { to, .. }
            | WireMessage::SnapshotRequest { to, .. }
            | WireMessage::Snapshot { to, .. } => Some(to),
            WireMessage::Doc { .. } | WireMessage::Unknown => None,
        }
    }

    /// Wire tag of this message, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Hello { .. } => "hello",
            WireMessage::HelloReply { .. } => "helloReply",
            WireMessage::Doc { .. } => "doc",
            WireMessage::SnapshotRequest { .. } => "snapshot:request",
            WireMessage::Snapshot { .. } => "snapshot",
            WireMessage::ClearAll { .. } => "clear:all",
            WireMessage::Unknown => "unknown",
        }
    }
}
