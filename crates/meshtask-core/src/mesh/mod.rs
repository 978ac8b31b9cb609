//! Peer mesh: one direct link to every other known peer
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  MeshManager                                                    │
//! │  ├── links: PeerId → PeerLink (connection, attempt, state)      │
//! │  ├── pending: PeerId → candidates received too early            │
//! │  └── Connector (creates a Connection per remote peer)           │
//! │                                                                 │
//! │  Relay presence ──► connect_to() ──► offer (initiator only)     │
//! │  Relay signals  ──► handle_signal() ──► answer / candidates     │
//! │  LinkEvents     ──► on_link_event() ──► Opened/Frame/Closed     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Of any two peers, the one with the lexicographically smaller identifier
//! initiates: it opens the data channel and sends the offer. The other side
//! waits for the offer. Candidates that arrive before the remote
//! description is set are buffered per peer and applied in arrival order
//! once it is.

pub mod connector;
pub mod memory;
pub mod signal;
pub mod tcp;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::MeshResult;
use crate::types::PeerId;

pub use connector::{
    AttemptId, Connection, ConnectionState, Connector, LinkEnvelope, LinkEvent, LinkEventSender,
};
pub use memory::{MemoryConnector, MemoryNetwork};
pub use signal::{Candidate, SessionDescription, SignalPayload};
pub use tcp::TcpConnector;

/// Returns true if `local` initiates the link to `remote`
pub fn is_initiator(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}

/// Lifecycle of a peer link as seen by the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Negotiating; frames cannot be sent yet
    Connecting,
    /// Data channel open
    Open,
    /// Torn down and removed
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Open => write!(f, "open"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

/// Snapshot of one link, for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer: PeerId,
    pub state: LinkState,
    pub initiator: bool,
}

/// A negotiation message to relay to `to`
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    pub to: PeerId,
    pub payload: SignalPayload,
}

/// What a link event means to the node
#[derive(Debug, Clone, PartialEq)]
pub enum LinkUpdate {
    /// The link just opened; the node should announce itself
    Opened(PeerId),
    /// A frame arrived on the link
    Frame(PeerId, String),
    /// The link was removed
    Closed(PeerId),
    /// A local candidate must be relayed
    Signal(OutboundSignal),
    /// Nothing to do (stale attempt or uninteresting state)
    Ignored,
}

struct PeerLink {
    attempt: AttemptId,
    conn: Box<dyn Connection>,
    initiator: bool,
    state: LinkState,
}

/// Owns every peer link and drives its negotiation
pub struct MeshManager {
    local: PeerId,
    connector: Arc<dyn Connector>,
    links: HashMap<PeerId, PeerLink>,
    pending: HashMap<PeerId, Vec<Candidate>>,
    next_attempt: AttemptId,
    event_tx: mpsc::UnboundedSender<LinkEnvelope>,
}

impl MeshManager {
    /// Create a manager; link events for every connection arrive on the
    /// returned receiver
    pub fn new(
        local: PeerId,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEnvelope>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manager = Self {
            local,
            connector,
            links: HashMap::new(),
            pending: HashMap::new(),
            next_attempt: 1,
            event_tx,
        };
        (manager, event_rx)
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Link Establishment
    // ═══════════════════════════════════════════════════════════════════════

    /// Start a link to a newly discovered peer
    ///
    /// Ignores our own identifier and peers we already have a link to. As
    /// initiator, returns the offer to relay; as responder, returns nothing
    /// and waits for the remote offer.
    ///
    /// # Errors
    ///
    /// Returns the connector's error if the connection or offer cannot be
    /// created. No link is kept in that case.
    pub fn connect_to(&mut self, remote: &PeerId) -> MeshResult<Vec<OutboundSignal>> {
        if *remote == self.local || self.links.contains_key(remote) {
            return Ok(Vec::new());
        }

        let initiator = is_initiator(&self.local, remote);
        let attempt = self.next_attempt;
        self.next_attempt += 1;

        let events = LinkEventSender::new(remote.clone(), attempt, self.event_tx.clone());
        let mut conn = self.connector.connect(remote, initiator, events)?;

        let mut out = Vec::new();
        if initiator {
            match conn.create_offer() {
                Ok(session) => out.push(OutboundSignal {
                    to: remote.clone(),
                    payload: SignalPayload::Offer { session },
                }),
                Err(e) => {
                    conn.close();
                    return Err(e);
                }
            }
        }

        info!(peer = %remote, initiator, attempt, "Connecting to peer");
        self.links.insert(
            remote.clone(),
            PeerLink {
                attempt,
                conn,
                initiator,
                state: LinkState::Connecting,
            },
        );
        Ok(out)
    }

    /// Handle a negotiation message relayed from `from`
    ///
    /// Signals from peers we hold no link for are dropped. Negotiation
    /// failures are logged and leave the link in place.
    pub fn handle_signal(&mut self, from: &PeerId, payload: SignalPayload) -> Vec<OutboundSignal> {
        let Some(link) = self.links.get_mut(from) else {
            debug!(%from, kind = payload.kind(), "Signal from unknown peer dropped");
            return Vec::new();
        };

        match payload {
            SignalPayload::Offer { session } => {
                if let Err(e) = link.conn.set_remote_description(session) {
                    warn!(%from, error = %e, "Failed to apply offer");
                    return Vec::new();
                }
                self.flush_candidates(from);

                let Some(link) = self.links.get_mut(from) else {
                    return Vec::new();
                };
                match link.conn.create_answer() {
                    Ok(session) => vec![OutboundSignal {
                        to: from.clone(),
                        payload: SignalPayload::Answer { session },
                    }],
                    Err(e) => {
                        warn!(%from, error = %e, "Failed to create answer");
                        Vec::new()
                    }
                }
            }
            SignalPayload::Answer { session } => {
                if let Err(e) = link.conn.set_remote_description(session) {
                    warn!(%from, error = %e, "Failed to apply answer");
                    return Vec::new();
                }
                self.flush_candidates(from);
                Vec::new()
            }
            SignalPayload::Candidate { candidate } => {
                if link.conn.has_remote_description() {
                    if let Err(e) = link.conn.add_candidate(candidate) {
                        warn!(%from, error = %e, "Failed to add candidate");
                    }
                } else {
                    debug!(%from, "Buffering early candidate");
                    self.pending.entry(from.clone()).or_default().push(candidate);
                }
                Vec::new()
            }
        }
    }

    /// Apply buffered candidates for `peer` in arrival order, then drop the
    /// buffer. A candidate that fails is logged and the rest still applied.
    fn flush_candidates(&mut self, peer: &PeerId) {
        let Some(buffered) = self.pending.remove(peer) else {
            return;
        };
        let Some(link) = self.links.get_mut(peer) else {
            return;
        };
        debug!(%peer, count = buffered.len(), "Flushing buffered candidates");
        for candidate in buffered {
            if let Err(e) = link.conn.add_candidate(candidate) {
                warn!(%peer, error = %e, "Failed to add buffered candidate");
            }
        }
    }

    /// Interpret an event reported by a connection
    pub fn on_link_event(&mut self, envelope: LinkEnvelope) -> LinkUpdate {
        let LinkEnvelope {
            peer,
            attempt,
            event,
        } = envelope;

        match self.links.get(&peer) {
            Some(link) if link.attempt == attempt => {}
            _ => {
                debug!(%peer, attempt, "Event from stale link ignored");
                return LinkUpdate::Ignored;
            }
        }

        match event {
            LinkEvent::LocalCandidate(candidate) => LinkUpdate::Signal(OutboundSignal {
                to: peer,
                payload: SignalPayload::Candidate { candidate },
            }),
            LinkEvent::ChannelOpen => {
                if let Some(link) = self.links.get_mut(&peer) {
                    link.state = LinkState::Open;
                }
                info!(%peer, "Link open");
                LinkUpdate::Opened(peer)
            }
            LinkEvent::Frame(raw) => LinkUpdate::Frame(peer, raw),
            LinkEvent::ChannelClosed => {
                self.remove_peer(&peer);
                LinkUpdate::Closed(peer)
            }
            LinkEvent::StateChanged(state) if state.is_terminal() => {
                debug!(%peer, ?state, "Connection ended");
                self.remove_peer(&peer);
                LinkUpdate::Closed(peer)
            }
            LinkEvent::StateChanged(state) => {
                debug!(%peer, ?state, "Connection state");
                LinkUpdate::Ignored
            }
        }
    }

    /// Close and forget the link to `peer`, along with buffered candidates
    ///
    /// Returns whether a link existed. Safe to call repeatedly.
    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        self.pending.remove(peer);
        match self.links.remove(peer) {
            Some(mut link) => {
                link.conn.close();
                info!(%peer, "Link removed");
                true
            }
            None => false,
        }
    }

    /// Close every link
    pub fn close_all(&mut self) {
        let peers: Vec<PeerId> = self.links.keys().cloned().collect();
        for peer in peers {
            self.remove_peer(&peer);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sending
    // ═══════════════════════════════════════════════════════════════════════

    /// Send on one peer's link. Returns false, without error, if the peer has
    /// no open link.
    pub fn send_to(&mut self, peer: &PeerId, frame: &str) -> bool {
        let Some(link) = self.links.get_mut(peer) else {
            return false;
        };
        if link.state != LinkState::Open || !link.conn.is_open() {
            return false;
        }
        match link.conn.send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(%peer, error = %e, "Send failed");
                false
            }
        }
    }

    /// Send on every open link except `except`; returns how many were sent
    pub fn broadcast(&mut self, frame: &str, except: Option<&PeerId>) -> usize {
        let targets: Vec<PeerId> = self
            .links
            .keys()
            .filter(|p| Some(*p) != except)
            .cloned()
            .collect();
        targets
            .iter()
            .filter(|peer| self.send_to(peer, frame))
            .count()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inspection
    // ═══════════════════════════════════════════════════════════════════════

    pub fn has_link(&self, peer: &PeerId) -> bool {
        self.links.contains_key(peer)
    }

    pub fn link_state(&self, peer: &PeerId) -> Option<LinkState> {
        self.links.get(peer).map(|l| l.state)
    }

    pub fn pending_candidates(&self, peer: &PeerId) -> usize {
        self.pending.get(peer).map(Vec::len).unwrap_or(0)
    }

    /// Peers with an open link, sorted
    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, l)| l.state == LinkState::Open)
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn open_count(&self) -> usize {
        self.links
            .values()
            .filter(|l| l.state == LinkState::Open)
            .count()
    }

    /// Every link, sorted by peer
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .links
            .iter()
            .map(|(peer, link)| PeerInfo {
                peer: peer.clone(),
                state: link.state,
                initiator: link.initiator,
            })
            .collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));
        peers
    }
}
