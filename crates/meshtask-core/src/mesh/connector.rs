//! Transport seam between the mesh manager and whatever carries link bytes
//!
//! A [`Connector`] creates one [`Connection`] per remote peer. Negotiation
//! calls are synchronous; anything that completes later (a local candidate
//! being gathered, the channel opening, a frame arriving) is reported
//! through the [`LinkEventSender`] handed to the connection at creation.
//! Every event is tagged with the attempt it belongs to so events from a
//! torn-down link can be told apart from those of its replacement.

use tokio::sync::mpsc;

use crate::error::MeshResult;
use crate::mesh::signal::{Candidate, SessionDescription};
use crate::types::PeerId;

/// Identifies one link attempt to a peer
pub type AttemptId = u64;

/// Coarse transport state reported by a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the link is removed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// Asynchronous happenings on a link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A local candidate to relay to the remote peer
    LocalCandidate(Candidate),
    /// The data channel is ready for frames
    ChannelOpen,
    /// One text frame from the remote peer
    Frame(String),
    /// The data channel closed
    ChannelClosed,
    StateChanged(ConnectionState),
}

/// A link event together with the link it happened on
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEnvelope {
    pub peer: PeerId,
    pub attempt: AttemptId,
    pub event: LinkEvent,
}

/// Cloneable sender bound to one link attempt
#[derive(Debug, Clone)]
pub struct LinkEventSender {
    peer: PeerId,
    attempt: AttemptId,
    tx: mpsc::UnboundedSender<LinkEnvelope>,
}

impl LinkEventSender {
    pub fn new(peer: PeerId, attempt: AttemptId, tx: mpsc::UnboundedSender<LinkEnvelope>) -> Self {
        Self { peer, attempt, tx }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    /// Report an event; returns `false` once the mesh has gone away
    pub fn send(&self, event: LinkEvent) -> bool {
        self.tx
            .send(LinkEnvelope {
                peer: self.peer.clone(),
                attempt: self.attempt,
                event,
            })
            .is_ok()
    }
}

/// One side of a link to a remote peer
pub trait Connection: Send {
    /// Produce the initiator's session description
    fn create_offer(&mut self) -> MeshResult<SessionDescription>;

    /// Produce the responder's session description, after the offer is set
    fn create_answer(&mut self) -> MeshResult<SessionDescription>;

    fn set_remote_description(&mut self, session: SessionDescription) -> MeshResult<()>;

    fn has_remote_description(&self) -> bool;

    /// Apply a candidate relayed from the remote peer
    fn add_candidate(&mut self, candidate: Candidate) -> MeshResult<()>;

    fn is_open(&self) -> bool;

    /// Send one text frame; fails if the channel is not open
    fn send(&mut self, frame: &str) -> MeshResult<()>;

    /// Tear the link down. Calling it again is a no-op.
    fn close(&mut self);
}

/// Factory for connections
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        remote: &PeerId,
        initiator: bool,
        events: LinkEventSender,
    ) -> MeshResult<Box<dyn Connection>>;
}
