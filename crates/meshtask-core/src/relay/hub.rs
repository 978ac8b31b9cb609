//! Relay membership and routing state, independent of the transport

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::relay::{RelayFrame, SignalingChannel};
use crate::types::PeerId;

/// One transport connection to the relay
pub type SessionId = u64;

struct Session {
    tx: mpsc::UnboundedSender<RelayFrame>,
    peer: Option<PeerId>,
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<SessionId, Session>,
    peers: HashMap<PeerId, SessionId>,
    next_session: SessionId,
}

impl HubState {
    fn send(&self, session: SessionId, frame: RelayFrame) {
        if let Some(s) = self.sessions.get(&session) {
            let _ = s.tx.send(frame);
        }
    }

    fn send_to_others(&self, except: SessionId, frame: &RelayFrame) {
        for (id, session) in &self.sessions {
            if *id != except {
                let _ = session.tx.send(frame.clone());
            }
        }
    }
}

/// Shared relay state; clones refer to the same hub
#[derive(Clone, Default)]
pub struct RelayHub {
    state: Arc<Mutex<HubState>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; frames for it are delivered to `tx`
    pub fn register(&self, tx: mpsc::UnboundedSender<RelayFrame>) -> SessionId {
        let mut state = self.state.lock();
        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(id, Session { tx, peer: None });
        debug!(session = id, "Relay session opened");
        id
    }

    /// Process one frame sent by `session`
    pub fn handle(&self, session: SessionId, frame: RelayFrame) {
        let mut state = self.state.lock();
        match frame {
            RelayFrame::Join { peer_id } => {
                let Some(peer_id) = peer_id.filter(|p| !p.as_str().is_empty()) else {
                    debug!(session, "Join without peer id ignored");
                    return;
                };
                if let Some(s) = state.sessions.get_mut(&session) {
                    s.peer = Some(peer_id.clone());
                }
                state.peers.insert(peer_id.clone(), session);

                let mut others: Vec<PeerId> = state
                    .peers
                    .keys()
                    .filter(|p| **p != peer_id)
                    .cloned()
                    .collect();
                others.sort();
                info!(peer = %peer_id, others = others.len(), "Peer joined relay");
                state.send(session, RelayFrame::Peers { peers: others });
                state.send_to_others(session, &RelayFrame::PeerJoin { peer_id });
            }
            RelayFrame::Signal { from, to, data } => {
                let (Some(from), Some(to), Some(data)) = (from, to, data) else {
                    debug!(session, "Incomplete signal dropped");
                    return;
                };
                match state.peers.get(&to).copied() {
                    Some(target) => {
                        debug!(%from, %to, "Routing signal");
                        state.send(target, RelayFrame::signal(from, to, data));
                    }
                    None => debug!(%from, %to, "Signal for unknown peer dropped"),
                }
            }
            other => warn!(session, ?other, "Unexpected frame from peer"),
        }
    }

    /// Forget a closed connection, announcing its peer's departure if the
    /// peer is still mapped to it
    pub fn disconnect(&self, session: SessionId) {
        let mut state = self.state.lock();
        let Some(closed) = state.sessions.remove(&session) else {
            return;
        };
        debug!(session, "Relay session closed");
        let Some(peer_id) = closed.peer else {
            return;
        };
        if state.peers.get(&peer_id) == Some(&session) {
            state.peers.remove(&peer_id);
            info!(peer = %peer_id, "Peer left relay");
            state.send_to_others(session, &RelayFrame::PeerLeave { peer_id });
        }
    }

    /// Joined peers, sorted
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.state.lock().peers.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// In-process connection to this hub
    ///
    /// Must be called within a tokio runtime. The session closes once the
    /// returned channel is dropped.
    pub fn connect_local(&self) -> SignalingChannel {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let session = self.register(in_tx);

        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                hub.handle(session, frame);
            }
            hub.disconnect(session);
        });

        SignalingChannel::new(out_tx, in_rx)
    }
}
