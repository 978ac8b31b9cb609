//! Mesh node - one task that owns a peer's sync state
//!
//! ```text
//! ┌──────────────┐  Command + oneshot   ┌─────────────────────────────────┐
//! │  NodeHandle  │ ───────────────────► │  NodeActor (single tokio task)  │
//! │  (Clone)     │ ◄─── MeshEvent ───── │  ├── GossipEngine<S>            │
//! └──────────────┘      open links      │  ├── MeshManager                │
//!                       (watch)         │  └── SignalingChannel           │
//!                                       └─────────────────────────────────┘
//! ```
//!
//! The actor handles one input at a time (a user command, a relay frame or
//! a link event) and finishes it before looking at the next. Nothing else
//! touches the engine or the mesh, so no locks guard them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::mesh::{
    Connector, LinkEnvelope, LinkState, LinkUpdate, MeshManager, OutboundSignal, PeerInfo,
    SignalPayload,
};
use crate::relay::{RelayFrame, SignalingChannel};
use crate::storage::RecordStore;
use crate::sync::{GossipEngine, MeshEvent, NoticeLevel, Outbound};
use crate::types::{PeerId, Record};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Batch mutations that share one reply shape
#[derive(Debug, Clone)]
enum Mutation {
    Complete(String),
    Delete(String),
    CompleteMany(Vec<String>),
    CompleteAllPending,
    DeleteAllPending,
    DeleteAllDone,
    ClearAll,
}

impl Mutation {
    fn name(&self) -> &'static str {
        match self {
            Mutation::Complete(_) => "complete",
            Mutation::Delete(_) => "delete",
            Mutation::CompleteMany(_) => "complete_many",
            Mutation::CompleteAllPending => "complete_all_pending",
            Mutation::DeleteAllPending => "delete_all_pending",
            Mutation::DeleteAllDone => "delete_all_done",
            Mutation::ClearAll => "clear_all",
        }
    }

    fn failure_notice(&self) -> &'static str {
        match self {
            Mutation::Complete(_) | Mutation::CompleteMany(_) | Mutation::CompleteAllPending => {
                "Error completing task"
            }
            Mutation::Delete(_) | Mutation::DeleteAllPending | Mutation::DeleteAllDone => {
                "Error deleting task"
            }
            Mutation::ClearAll => "Error clearing database",
        }
    }
}

enum Command {
    CreateTask {
        text: String,
        reply: oneshot::Sender<MeshResult<Option<Record>>>,
    },
    Mutate {
        op: Mutation,
        reply: oneshot::Sender<MeshResult<()>>,
    },
    ListTasks {
        reply: oneshot::Sender<Vec<Record>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    OpenPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    SyncNow {
        reply: oneshot::Sender<usize>,
    },
    PushClear {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    PushSnapshot {
        peer: PeerId,
        reply: oneshot::Sender<MeshResult<bool>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Entry point for starting a node
pub struct MeshNode;

impl MeshNode {
    /// Start a node on the current tokio runtime
    ///
    /// The local identifier is `config.peer_id` when set, otherwise a fresh
    /// one. The node announces itself on `signaling` before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial listing cannot be loaded from `store`
    /// or the join frame cannot be queued for the relay.
    pub fn spawn<S: RecordStore>(
        config: &MeshConfig,
        store: S,
        connector: Arc<dyn Connector>,
        signaling: SignalingChannel,
    ) -> MeshResult<NodeHandle> {
        config.validate()?;
        let local = config.fixed_peer_id().unwrap_or_else(PeerId::generate);

        let engine = GossipEngine::with_capacity(local.clone(), store, config.event_capacity)?;
        let events = engine.event_sender();
        let (mesh, link_rx) = MeshManager::new(local.clone(), connector);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (open_tx, open_rx) = watch::channel(0usize);

        signaling.send(RelayFrame::join(local.clone()))?;
        info!(peer = %local, "Node starting");

        let actor = NodeActor {
            engine,
            mesh,
            signaling,
            relay_alive: true,
            events: events.clone(),
            open_tx,
        };
        tokio::spawn(actor.run(command_rx, link_rx));

        Ok(NodeHandle {
            local,
            commands: command_tx,
            events,
            open_links: open_rx,
            link_wait_timeout: config.link_wait_timeout(),
            link_poll_interval: config.link_poll_interval(),
            force_push_gap: config.force_push_gap(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Actor
// ═══════════════════════════════════════════════════════════════════════════

struct NodeActor<S: RecordStore> {
    engine: GossipEngine<S>,
    mesh: MeshManager,
    signaling: SignalingChannel,
    relay_alive: bool,
    events: broadcast::Sender<MeshEvent>,
    open_tx: watch::Sender<usize>,
}

impl<S: RecordStore> NodeActor<S> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEnvelope>,
    ) {
        debug!(peer = %self.engine.local(), "Node actor started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.mesh.close_all();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                frame = self.signaling.inbound.recv(), if self.relay_alive => match frame {
                    Some(frame) => self.handle_relay(frame),
                    None => {
                        warn!("Relay connection closed; existing links stay up");
                        self.relay_alive = false;
                    }
                },
                Some(envelope) = link_rx.recv() => self.handle_link(envelope),
            }
            self.open_tx.send_replace(self.mesh.open_count());
        }

        self.mesh.close_all();
        self.open_tx.send_replace(0);
        info!(peer = %self.engine.local(), "Node stopped");
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }

    fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit(MeshEvent::notice(level, message));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Commands
    // ═══════════════════════════════════════════════════════════════════════

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::CreateTask { text, reply } => {
                let _ = reply.send(self.create_task(&text));
            }
            Command::Mutate { op, reply } => {
                let _ = reply.send(self.mutate(op));
            }
            Command::ListTasks { reply } => {
                let _ = reply.send(self.engine.records().to_vec());
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.mesh.peers());
            }
            Command::OpenPeers { reply } => {
                let _ = reply.send(self.mesh.open_peers());
            }
            Command::SyncNow { reply } => {
                let peers = self.mesh.open_peers();
                let out = self.engine.sync_with(&peers);
                self.dispatch(out);
                let _ = reply.send(peers.len());
            }
            Command::PushClear { peer, reply } => {
                let out = self.engine.clear_for(&peer);
                let _ = reply.send(self.dispatch(vec![out]) > 0);
            }
            Command::PushSnapshot { peer, reply } => {
                let result = match self.engine.snapshot_for(&peer) {
                    Ok(out) => Ok(self.dispatch(vec![out]) > 0),
                    Err(e) => {
                        error!(to = %peer, error = %e, "Failed to build snapshot");
                        self.notify(NoticeLevel::Error, "Error sending snapshot");
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn create_task(&mut self, text: &str) -> MeshResult<Option<Record>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        match self.engine.create_task(text) {
            Ok((record, out)) => {
                self.dispatch(out);
                Ok(Some(record))
            }
            Err(e) => {
                error!(error = %e, "Failed to create task");
                self.notify(NoticeLevel::Error, "Error creating task");
                Err(e)
            }
        }
    }

    fn mutate(&mut self, op: Mutation) -> MeshResult<()> {
        let result = match &op {
            Mutation::Complete(id) => self.engine.complete_task(id),
            Mutation::Delete(id) => self.engine.delete_task(id),
            Mutation::CompleteMany(ids) => self.engine.complete_many(ids),
            Mutation::CompleteAllPending => self.engine.complete_all_pending(),
            Mutation::DeleteAllPending => self.engine.delete_all_pending(),
            Mutation::DeleteAllDone => self.engine.delete_all_done(),
            Mutation::ClearAll => self.engine.clear_all(),
        };
        match result {
            Ok(out) => {
                self.dispatch(out);
                Ok(())
            }
            Err(e) => {
                error!(op = op.name(), error = %e, "Mutation failed");
                self.notify(NoticeLevel::Error, op.failure_notice());
                Err(e)
            }
        }
    }

    /// Encode and send engine output; returns the number of frames sent
    fn dispatch(&mut self, outbound: Vec<Outbound>) -> usize {
        let mut sent = 0;
        for out in outbound {
            let frame = match out.message().encode() {
                Ok(frame) => frame,
                Err(e) => {
                    error!(kind = out.message().kind(), error = %e, "Failed to encode message");
                    continue;
                }
            };
            sent += match &out {
                Outbound::Broadcast { except, .. } => self.mesh.broadcast(&frame, except.as_ref()),
                Outbound::SendTo { peer, .. } => usize::from(self.mesh.send_to(peer, &frame)),
            };
        }
        sent
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Relay
    // ═══════════════════════════════════════════════════════════════════════

    fn handle_relay(&mut self, frame: RelayFrame) {
        match frame {
            RelayFrame::Peers { peers } => {
                debug!(count = peers.len(), "Peers present at relay");
                for peer in peers {
                    self.connect(&peer);
                }
            }
            RelayFrame::PeerJoin { peer_id } => self.connect(&peer_id),
            RelayFrame::PeerLeave { peer_id } => {
                if self.mesh.remove_peer(&peer_id) {
                    self.emit(MeshEvent::LinkStateChanged {
                        peer: peer_id,
                        state: LinkState::Closed,
                    });
                }
            }
            RelayFrame::Signal {
                from: Some(from),
                to: Some(to),
                data: Some(data),
            } if &to == self.engine.local() => match SignalPayload::from_value(data) {
                Ok(payload) => {
                    let signals = self.mesh.handle_signal(&from, payload);
                    self.relay_signals(signals);
                }
                Err(e) => warn!(%from, error = %e, "Invalid signal payload"),
            },
            other => debug!(?other, "Ignoring relay frame"),
        }
    }

    fn connect(&mut self, peer: &PeerId) {
        let fresh = peer != self.engine.local() && !self.mesh.has_link(peer);
        match self.mesh.connect_to(peer) {
            Ok(signals) => {
                if fresh && self.mesh.has_link(peer) {
                    self.emit(MeshEvent::LinkStateChanged {
                        peer: peer.clone(),
                        state: LinkState::Connecting,
                    });
                }
                self.relay_signals(signals);
            }
            Err(e) => warn!(%peer, error = %e, "Failed to start link"),
        }
    }

    fn relay_signals(&mut self, signals: Vec<OutboundSignal>) {
        for signal in signals {
            let data = match signal.payload.to_value() {
                Ok(data) => data,
                Err(e) => {
                    error!(to = %signal.to, error = %e, "Failed to encode signal");
                    continue;
                }
            };
            let frame = RelayFrame::signal(self.engine.local().clone(), signal.to, data);
            if let Err(e) = self.signaling.send(frame) {
                warn!(error = %e, "Signal not relayed");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Links
    // ═══════════════════════════════════════════════════════════════════════

    fn handle_link(&mut self, envelope: LinkEnvelope) {
        match self.mesh.on_link_event(envelope) {
            LinkUpdate::Opened(peer) => {
                self.emit(MeshEvent::LinkStateChanged {
                    peer: peer.clone(),
                    state: LinkState::Open,
                });
                let hello = self.engine.hello();
                self.dispatch(vec![Outbound::send_to(peer, hello)]);
            }
            LinkUpdate::Frame(peer, raw) => {
                let out = self.engine.handle_frame(&peer, &raw);
                self.dispatch(out);
            }
            LinkUpdate::Closed(peer) => {
                self.emit(MeshEvent::LinkStateChanged {
                    peer,
                    state: LinkState::Closed,
                });
            }
            LinkUpdate::Signal(signal) => self.relay_signals(vec![signal]),
            LinkUpdate::Ignored => {}
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Handle
// ═══════════════════════════════════════════════════════════════════════════

/// Cloneable handle to a running node
#[derive(Clone)]
pub struct NodeHandle {
    local: PeerId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<MeshEvent>,
    open_links: watch::Receiver<usize>,
    link_wait_timeout: Duration,
    link_poll_interval: Duration,
    force_push_gap: Duration,
}

impl NodeHandle {
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> MeshResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| MeshError::NodeStopped)?;
        rx.await.map_err(|_| MeshError::NodeStopped)
    }

    async fn mutate(&self, op: Mutation) -> MeshResult<()> {
        self.request(|reply| Command::Mutate { op, reply }).await?
    }

    fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let _ = self.events.send(MeshEvent::notice(level, message));
    }

    /// Create a task from `text`, trimmed
    ///
    /// Returns `None` without touching the store if the text is blank.
    pub async fn create_task(&self, text: impl Into<String>) -> MeshResult<Option<Record>> {
        let text = text.into();
        self.request(|reply| Command::CreateTask { text, reply })
            .await?
    }

    /// # Errors
    ///
    /// Returns `MeshError::NotFound` if no task with `id` is stored.
    pub async fn complete_task(&self, id: impl Into<String>) -> MeshResult<()> {
        self.mutate(Mutation::Complete(id.into())).await
    }

    pub async fn delete_task(&self, id: impl Into<String>) -> MeshResult<()> {
        self.mutate(Mutation::Delete(id.into())).await
    }

    pub async fn complete_many(&self, ids: Vec<String>) -> MeshResult<()> {
        self.mutate(Mutation::CompleteMany(ids)).await
    }

    pub async fn complete_all_pending(&self) -> MeshResult<()> {
        self.mutate(Mutation::CompleteAllPending).await
    }

    pub async fn delete_all_pending(&self) -> MeshResult<()> {
        self.mutate(Mutation::DeleteAllPending).await
    }

    pub async fn delete_all_done(&self) -> MeshResult<()> {
        self.mutate(Mutation::DeleteAllDone).await
    }

    /// Wipe the local store and every connected peer's store
    pub async fn clear_all(&self) -> MeshResult<()> {
        self.mutate(Mutation::ClearAll).await
    }

    /// Live tasks ordered by creation time
    pub async fn list_tasks(&self) -> MeshResult<Vec<Record>> {
        self.request(|reply| Command::ListTasks { reply }).await
    }

    /// Every link and its state, sorted by peer
    pub async fn peers(&self) -> MeshResult<Vec<PeerInfo>> {
        self.request(|reply| Command::Peers { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Number of links whose data channel is open
    pub fn open_link_count(&self) -> usize {
        *self.open_links.borrow()
    }

    /// Poll until at least one link is open, giving up after `timeout`
    pub async fn wait_for_open_link(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.open_link_count() > 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.link_poll_interval).await;
        }
    }

    /// Manual resync with every open link
    ///
    /// Returns `false` if no link opened within the configured wait.
    pub async fn sync_now(&self) -> MeshResult<bool> {
        self.notify(NoticeLevel::Info, "Syncing…");
        if !self.wait_for_open_link(self.link_wait_timeout).await {
            info!("Manual sync skipped: no open links");
            self.notify(NoticeLevel::Warning, "No connected peers");
            return Ok(false);
        }
        let peers = self.request(|reply| Command::SyncNow { reply }).await?;
        info!(peers, "Manual sync done");
        self.notify(NoticeLevel::Success, "Sync complete");
        Ok(true)
    }

    /// Make every open peer's store a copy of ours
    ///
    /// Each peer gets an addressed `clear:all`, then after a short pause a
    /// full snapshot. Returns how many peers were pushed to.
    pub async fn force_push(&self) -> MeshResult<usize> {
        self.notify(NoticeLevel::Info, "Pushing state to peers…");
        let peers = self.request(|reply| Command::OpenPeers { reply }).await?;

        let mut total = 0;
        for peer in peers {
            let target = peer.clone();
            if !self
                .request(|reply| Command::PushClear { peer: target, reply })
                .await?
            {
                debug!(%peer, "Link closed before push");
                continue;
            }
            tokio::time::sleep(self.force_push_gap).await;
            let target = peer.clone();
            self.request(|reply| Command::PushSnapshot { peer: target, reply })
                .await??;
            total += 1;
        }

        info!(peers = total, "Push completed");
        self.notify(NoticeLevel::Success, format!("Push completed. Peers: {}", total));
        Ok(total)
    }

    /// Close every link and stop the actor
    pub async fn shutdown(&self) -> MeshResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{MemoryConnector, MemoryNetwork};
    use crate::relay::RelayHub;
    use crate::storage::MemoryStore;

    fn config(peer: &str) -> MeshConfig {
        MeshConfig {
            peer_id: Some(peer.to_string()),
            link_wait_timeout_ms: 50,
            link_poll_interval_ms: 10,
            force_push_gap_ms: 1,
            ..MeshConfig::default()
        }
    }

    fn spawn(peer: &str, hub: &RelayHub, store: MemoryStore) -> NodeHandle {
        let connector = Arc::new(MemoryConnector::new(MemoryNetwork::new()));
        MeshNode::spawn(&config(peer), store, connector, hub.connect_local()).unwrap()
    }

    #[tokio::test]
    async fn test_local_mutations_without_peers() {
        let hub = RelayHub::new();
        let node = spawn("peer-a", &hub, MemoryStore::new());

        assert!(node.create_task("   ").await.unwrap().is_none());
        let record = node.create_task("  water plants ").await.unwrap().unwrap();
        assert_eq!(record.text, "water plants");

        node.complete_task(record.id.clone()).await.unwrap();
        let tasks = node.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].is_done());

        node.delete_task(record.id).await.unwrap();
        assert!(node.list_tasks().await.unwrap().is_empty());

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_complete_missing_reports_error_notice() {
        let hub = RelayHub::new();
        let node = spawn("peer-a", &hub, MemoryStore::new());
        let mut events = node.subscribe();

        let result = node.complete_task("nope").await;
        assert!(matches!(result, Err(MeshError::NotFound(_))));

        let mut saw_notice = false;
        while let Ok(event) = events.try_recv() {
            if let MeshEvent::Notice { level, message } = event {
                saw_notice |= level == NoticeLevel::Error && message == "Error completing task";
            }
        }
        assert!(saw_notice);
    }

    #[tokio::test]
    async fn test_sync_now_without_links() {
        let hub = RelayHub::new();
        let node = spawn("peer-a", &hub, MemoryStore::new());
        let mut events = node.subscribe();

        assert!(!node.sync_now().await.unwrap());
        assert_eq!(
            events.recv().await.unwrap(),
            MeshEvent::notice(NoticeLevel::Info, "Syncing…")
        );
        assert_eq!(
            events.recv().await.unwrap(),
            MeshEvent::notice(NoticeLevel::Warning, "No connected peers")
        );
        assert_eq!(node.force_push().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let hub = RelayHub::new();
        let node = spawn("peer-a", &hub, MemoryStore::new());
        node.shutdown().await.unwrap();
        assert!(matches!(
            node.list_tasks().await,
            Err(MeshError::NodeStopped)
        ));
    }

    #[tokio::test]
    async fn test_signal_for_another_peer_ignored() {
        use crate::mesh::{SessionDescription, SignalPayload};

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(MemoryConnector::new(MemoryNetwork::new()));
        let _node = MeshNode::spawn(
            &config("peer-b"),
            MemoryStore::new(),
            connector,
            SignalingChannel::new(out_tx, in_rx),
        )
        .unwrap();
        assert!(matches!(out_rx.recv().await, Some(RelayFrame::Join { .. })));

        let a = PeerId::new("peer-a");
        let offer = |sdp: &str| {
            SignalPayload::Offer {
                session: SessionDescription::new(sdp),
            }
            .to_value()
            .unwrap()
        };
        in_tx.send(RelayFrame::Peers { peers: vec![a.clone()] }).unwrap();
        in_tx
            .send(RelayFrame::signal(a.clone(), PeerId::new("peer-z"), offer("mem-elsewhere")))
            .unwrap();
        in_tx
            .send(RelayFrame::signal(a.clone(), PeerId::new("peer-b"), offer("mem-ours")))
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let RelayFrame::Signal { to: Some(to), data: Some(data), .. } = reply else {
            panic!("expected an answer signal");
        };
        assert_eq!(to, a);
        assert_eq!(
            SignalPayload::from_value(data).unwrap(),
            SignalPayload::Answer {
                session: SessionDescription::new("mem-ours")
            }
        );
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_node_joins_relay() {
        let hub = RelayHub::new();
        let _node = spawn("peer-a", &hub, MemoryStore::new());
        let deadline = Instant::now() + Duration::from_secs(2);
        while hub.peers().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hub.peers(), vec![PeerId::new("peer-a")]);
    }
}
