//! Signaling relay used only to bootstrap peer links
//!
//! ## Overview
//!
//! ```text
//! ┌──────────┐  join / signal   ┌───────────┐  peers / peer-join /  ┌──────────┐
//! │  peer A  │ ───────────────► │ RelayHub  │ ────────────────────► │  peer B  │
//! └──────────┘                  └───────────┘  peer-leave / signal  └──────────┘
//! ```
//!
//! The relay never interprets signal payloads. It tracks which connection
//! announced which peer identifier, routes `signal` frames by their `to`
//! field, and tells everyone else when a peer joins or leaves. Frames are
//! JSON objects tagged by `event`, one per line on the TCP transport.

pub mod client;
pub mod hub;
pub mod server;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{MeshError, MeshResult};
use crate::types::PeerId;

pub use client::RelayClient;
pub use hub::{RelayHub, SessionId};
pub use server::RelayServer;

/// Frames exchanged between peers and the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RelayFrame {
    /// Peer → relay: announce our identifier
    Join {
        #[serde(rename = "peerId", default)]
        peer_id: Option<PeerId>,
    },
    /// Relay → peer: everyone else currently joined
    Peers { peers: Vec<PeerId> },
    /// Relay → peers: someone joined
    PeerJoin {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Relay → peers: someone left
    PeerLeave {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Opaque negotiation payload routed to `to`
    Signal {
        #[serde(default)]
        from: Option<PeerId>,
        #[serde(default)]
        to: Option<PeerId>,
        #[serde(default)]
        data: Option<Value>,
    },
}

impl RelayFrame {
    pub fn join(peer_id: PeerId) -> Self {
        RelayFrame::Join {
            peer_id: Some(peer_id),
        }
    }

    pub fn signal(from: PeerId, to: PeerId, data: Value) -> Self {
        RelayFrame::Signal {
            from: Some(from),
            to: Some(to),
            data: Some(data),
        }
    }

    pub fn encode(&self) -> MeshResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> MeshResult<Self> {
        serde_json::from_str(line).map_err(|e| MeshError::Malformed(e.to_string()))
    }
}

/// A peer's two-way connection to the relay
pub struct SignalingChannel {
    pub outbound: mpsc::UnboundedSender<RelayFrame>,
    pub inbound: mpsc::UnboundedReceiver<RelayFrame>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingChannel {
    pub fn new(
        outbound: mpsc::UnboundedSender<RelayFrame>,
        inbound: mpsc::UnboundedReceiver<RelayFrame>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    /// Tie background tasks to the channel's lifetime
    pub(crate) fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Queue a frame for the relay; fails once the relay connection is gone
    pub fn send(&self, frame: RelayFrame) -> MeshResult<()> {
        self.outbound
            .send(frame)
            .map_err(|_| MeshError::Signaling("relay connection closed".into()))
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
