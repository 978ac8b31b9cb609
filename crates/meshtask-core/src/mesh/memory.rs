//! In-process links for tests and local simulations
//!
//! Follows the same negotiation shape as the TCP connector: the initiator's
//! offer registers a session on the shared [`MemoryNetwork`] and advertises
//! it as its candidate; the responder "dials" by applying that candidate.
//! Frames are handed straight to the remote side's event sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{MeshError, MeshResult};
use crate::mesh::connector::{Connection, ConnectionState, Connector, LinkEvent, LinkEventSender};
use crate::mesh::signal::{Candidate, SessionDescription};
use crate::types::PeerId;

struct Side {
    events: LinkEventSender,
    remote: Option<Weak<Mutex<Side>>>,
    closed: bool,
}

/// Registry of sessions waiting for a responder
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listening: Arc<Mutex<HashMap<String, Weak<Mutex<Side>>>>>,
    next_session: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of offers not yet picked up by a responder
    pub fn listening(&self) -> usize {
        self.listening.lock().len()
    }
}

#[derive(Clone, Default)]
pub struct MemoryConnector {
    network: MemoryNetwork,
}

impl MemoryConnector {
    pub fn new(network: MemoryNetwork) -> Self {
        Self { network }
    }
}

impl Connector for MemoryConnector {
    fn connect(
        &self,
        _remote: &PeerId,
        initiator: bool,
        events: LinkEventSender,
    ) -> MeshResult<Box<dyn Connection>> {
        Ok(Box::new(MemoryConnection {
            initiator,
            network: self.network.clone(),
            side: Arc::new(Mutex::new(Side {
                events,
                remote: None,
                closed: false,
            })),
            session: None,
            remote_description: None,
        }))
    }
}

pub struct MemoryConnection {
    initiator: bool,
    network: MemoryNetwork,
    side: Arc<Mutex<Side>>,
    session: Option<String>,
    remote_description: Option<SessionDescription>,
}

impl MemoryConnection {
    fn remote(&self) -> Option<Arc<Mutex<Side>>> {
        self.side.lock().remote.as_ref().and_then(Weak::upgrade)
    }

    fn events(&self) -> LinkEventSender {
        self.side.lock().events.clone()
    }
}

impl Connection for MemoryConnection {
    fn create_offer(&mut self) -> MeshResult<SessionDescription> {
        if !self.initiator {
            return Err(MeshError::Negotiation("responder cannot create an offer".into()));
        }
        let n = self.network.next_session.fetch_add(1, Ordering::SeqCst);
        let session = format!("mem-{}", n);
        self.network
            .listening
            .lock()
            .insert(session.clone(), Arc::downgrade(&self.side));
        self.session = Some(session.clone());

        self.events()
            .send(LinkEvent::LocalCandidate(Candidate::new(session.clone())));
        Ok(SessionDescription::new(session))
    }

    fn create_answer(&mut self) -> MeshResult<SessionDescription> {
        self.remote_description
            .clone()
            .ok_or_else(|| MeshError::Negotiation("no offer set".into()))
    }

    fn set_remote_description(&mut self, session: SessionDescription) -> MeshResult<()> {
        self.remote_description = Some(session);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.remote_description.is_some()
    }

    fn add_candidate(&mut self, candidate: Candidate) -> MeshResult<()> {
        if self.initiator || self.remote().is_some() {
            return Ok(());
        }
        let listener = self
            .network
            .listening
            .lock()
            .remove(&candidate.address)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| {
                MeshError::Negotiation(format!("nobody listening at {}", candidate.address))
            })?;

        self.side.lock().remote = Some(Arc::downgrade(&listener));
        let remote_events = {
            let mut remote = listener.lock();
            remote.remote = Some(Arc::downgrade(&self.side));
            remote.events.clone()
        };

        debug!(session = %candidate.address, "Memory link connected");
        for events in [self.events(), remote_events] {
            events.send(LinkEvent::StateChanged(ConnectionState::Connected));
            events.send(LinkEvent::ChannelOpen);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        let closed = self.side.lock().closed;
        !closed && self.remote().is_some()
    }

    fn send(&mut self, frame: &str) -> MeshResult<()> {
        if self.side.lock().closed {
            return Err(MeshError::Transport("channel closed".into()));
        }
        let remote = self
            .remote()
            .ok_or_else(|| MeshError::Transport("channel not open".into()))?;
        let events = remote.lock().events.clone();
        if events.send(LinkEvent::Frame(frame.to_string())) {
            Ok(())
        } else {
            Err(MeshError::Transport("remote gone".into()))
        }
    }

    fn close(&mut self) {
        let remote = {
            let mut side = self.side.lock();
            if side.closed {
                return;
            }
            side.closed = true;
            side.remote.take().and_then(|weak| weak.upgrade())
        };
        if let Some(session) = self.session.take() {
            self.network.listening.lock().remove(&session);
        }
        if let Some(remote) = remote {
            let events = {
                let mut remote = remote.lock();
                remote.remote = None;
                remote.events.clone()
            };
            events.send(LinkEvent::ChannelClosed);
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}
