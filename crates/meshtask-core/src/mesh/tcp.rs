//! Direct TCP links carrying newline-delimited text frames
//!
//! ```text
//! initiator                                   responder
//!   create_offer: bind ephemeral listener
//!   offer {sdp: session token} ────────────────►  set_remote_description
//!   candidate {address: listener addr} ────────►  add_candidate: dial addr
//!                                    ◄──────────  first line: session token
//!   token matches: channel open                   channel open
//! ```
//!
//! The session token lets the initiator's listener reject strangers. Once
//! the handshake line is exchanged each side runs a reader task forwarding
//! frames as [`LinkEvent::Frame`] and a writer task draining an outbound
//! queue, so `send` never blocks the caller.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

use crate::error::{MeshError, MeshResult};
use crate::mesh::connector::{Connection, ConnectionState, Connector, LinkEvent, LinkEventSender};
use crate::mesh::signal::{Candidate, SessionDescription};
use crate::types::PeerId;

/// Largest accepted frame; a snapshot of every record travels as one line
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// How long an accepted socket has to present the session token
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates TCP connections listening on `bind_host`
#[derive(Debug, Clone)]
pub struct TcpConnector {
    bind_host: String,
}

impl TcpConnector {
    pub fn new(bind_host: impl Into<String>) -> Self {
        Self {
            bind_host: bind_host.into(),
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new("127.0.0.1")
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        remote: &PeerId,
        initiator: bool,
        events: LinkEventSender,
    ) -> MeshResult<Box<dyn Connection>> {
        debug!(peer = %remote, initiator, "Creating TCP connection");
        Ok(Box::new(TcpConnection {
            initiator,
            bind_host: self.bind_host.clone(),
            token: None,
            remote: None,
            events,
            shared: Arc::new(Mutex::new(Shared::default())),
            claimed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

#[derive(Default)]
struct Shared {
    writer: Option<mpsc::UnboundedSender<String>>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

type LineStream = Framed<TcpStream, LinesCodec>;

pub struct TcpConnection {
    initiator: bool,
    bind_host: String,
    token: Option<String>,
    remote: Option<SessionDescription>,
    events: LinkEventSender,
    shared: Arc<Mutex<Shared>>,
    /// Set by whichever socket completes the handshake first
    claimed: Arc<AtomicBool>,
}

impl TcpConnection {
    fn track(&self, task: JoinHandle<()>) {
        let mut shared = self.shared.lock();
        if shared.closed {
            task.abort();
        } else {
            shared.tasks.push(task);
        }
    }
}

impl Connection for TcpConnection {
    fn create_offer(&mut self) -> MeshResult<SessionDescription> {
        if !self.initiator {
            return Err(MeshError::Negotiation("responder cannot create an offer".into()));
        }

        let std_listener = std::net::TcpListener::bind((self.bind_host.as_str(), 0))?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;
        let listener = TcpListener::from_std(std_listener)?;

        let token = ulid::Ulid::new().to_string();
        self.token = Some(token.clone());

        let task = tokio::spawn(accept_loop(
            listener,
            token.clone(),
            self.events.clone(),
            self.shared.clone(),
            self.claimed.clone(),
        ));
        self.track(task);

        debug!(peer = %self.events.peer(), %local_addr, "Listening for link");
        self.events
            .send(LinkEvent::LocalCandidate(Candidate::new(local_addr.to_string())));
        Ok(SessionDescription::new(token))
    }

    fn create_answer(&mut self) -> MeshResult<SessionDescription> {
        match (&self.remote, self.initiator) {
            (Some(offer), false) => Ok(offer.clone()),
            (None, _) => Err(MeshError::Negotiation("no offer set".into())),
            (Some(_), true) => Err(MeshError::Negotiation("initiator cannot answer".into())),
        }
    }

    fn set_remote_description(&mut self, session: SessionDescription) -> MeshResult<()> {
        if !self.initiator {
            self.token = Some(session.sdp.clone());
        }
        self.remote = Some(session);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.remote.is_some()
    }

    fn add_candidate(&mut self, candidate: Candidate) -> MeshResult<()> {
        if self.initiator {
            debug!(address = %candidate.address, "Initiator ignores remote candidate");
            return Ok(());
        }
        if self.claimed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let token = self
            .token
            .clone()
            .ok_or_else(|| MeshError::Negotiation("candidate before offer".into()))?;
        let addr: SocketAddr = candidate
            .address
            .parse()
            .map_err(|_| MeshError::Negotiation(format!("bad candidate {}", candidate.address)))?;

        let task = tokio::spawn(dial(
            addr,
            token,
            self.events.clone(),
            self.shared.clone(),
            self.claimed.clone(),
        ));
        self.track(task);
        Ok(())
    }

    fn is_open(&self) -> bool {
        let shared = self.shared.lock();
        !shared.closed && shared.writer.is_some()
    }

    fn send(&mut self, frame: &str) -> MeshResult<()> {
        let writer = self
            .shared
            .lock()
            .writer
            .clone()
            .ok_or_else(|| MeshError::Transport("channel not open".into()))?;
        writer
            .send(frame.to_string())
            .map_err(|_| MeshError::Transport("channel closed".into()))
    }

    fn close(&mut self) {
        let tasks = {
            let mut shared = self.shared.lock();
            if shared.closed {
                return;
            }
            shared.closed = true;
            shared.writer = None;
            std::mem::take(&mut shared.tasks)
        };
        for task in tasks {
            task.abort();
        }
        debug!(peer = %self.events.peer(), "TCP connection closed");
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    listener: TcpListener,
    token: String,
    events: LinkEventSender,
    shared: Arc<Mutex<Shared>>,
    claimed: Arc<AtomicBool>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Link listener failed");
                events.send(LinkEvent::StateChanged(ConnectionState::Failed));
                return;
            }
        };

        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
            Ok(Some(Ok(line))) if line == token => {
                if claimed.swap(true, Ordering::SeqCst) {
                    return;
                }
                debug!(%addr, "Link handshake accepted");
                start_channel(framed, events, shared);
                return;
            }
            _ => debug!(%addr, "Rejected connection without session token"),
        }
    }
}

async fn dial(
    addr: SocketAddr,
    token: String,
    events: LinkEventSender,
    shared: Arc<Mutex<Shared>>,
    claimed: Arc<AtomicBool>,
) {
    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%addr, error = %e, "Dial failed");
            events.send(LinkEvent::StateChanged(ConnectionState::Failed));
            return;
        }
    };
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
    if let Err(e) = framed.send(token).await {
        warn!(%addr, error = %e, "Handshake failed");
        events.send(LinkEvent::StateChanged(ConnectionState::Failed));
        return;
    }
    if claimed.swap(true, Ordering::SeqCst) {
        return;
    }
    start_channel(framed, events, shared);
}

fn start_channel(framed: LineStream, events: LinkEventSender, shared: Arc<Mutex<Shared>>) {
    let (mut sink, mut stream) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                debug!(error = %e, "Link write failed");
                break;
            }
        }
    });

    {
        let mut guard = shared.lock();
        if guard.closed {
            writer.abort();
            return;
        }
        guard.writer = Some(tx);
        guard.tasks.push(writer);
    }

    // Open must be reported before the first frame is forwarded.
    events.send(LinkEvent::StateChanged(ConnectionState::Connected));
    events.send(LinkEvent::ChannelOpen);

    let reader_events = events.clone();
    let reader = tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(line) => {
                    if !reader_events.send(LinkEvent::Frame(line)) {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Link read failed");
                    break;
                }
            }
        }
        reader_events.send(LinkEvent::ChannelClosed);
    });

    let mut guard = shared.lock();
    if guard.closed {
        reader.abort();
    } else {
        guard.tasks.push(reader);
    }
}
