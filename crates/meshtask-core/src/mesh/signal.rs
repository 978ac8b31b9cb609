//! Negotiation payloads relayed between peers during link setup

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

/// Opaque session description produced by one side of a link
///
/// Connectors decide what `sdp` holds; the mesh only moves it around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// A transport address the remote side may try to reach us at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub address: String,
}

impl Candidate {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

/// Signal carried in the relay's `data` field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { session: SessionDescription },
    Answer { session: SessionDescription },
    Candidate { candidate: Candidate },
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate { .. } => "candidate",
        }
    }

    pub fn to_value(&self) -> MeshResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> MeshResult<Self> {
        serde_json::from_value(value).map_err(|e| MeshError::Malformed(e.to_string()))
    }
}
