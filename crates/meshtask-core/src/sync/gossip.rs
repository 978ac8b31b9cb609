//! Flood-fill gossip over open peer links
//!
//! The engine is a synchronous state machine. Callers feed it inbound frames
//! and local mutations; it updates the store and returns the messages that
//! must go out, as [`Outbound`] instructions. It never touches links itself,
//! so the mesh manager and the engine can be driven independently.
//!
//! ## Flood termination
//!
//! Every peer re-broadcasts each novel `doc` to all its other open links.
//! A seen-set keyed by `(id, clock)` stops the flood: a version already seen
//! is dropped before it is applied or forwarded. Whether the resolver applied
//! or rejected a version plays no part in forwarding.

use std::collections::HashSet;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::clock::ClockToken;
use crate::error::{MeshError, MeshResult};
use crate::storage::RecordStore;
use crate::sync::events::{MeshEvent, NoticeLevel};
use crate::sync::protocol::WireMessage;
use crate::sync::resolver::{reconcile, Resolution};
use crate::sync::snapshot::{produce_snapshot, SnapshotDecision, SnapshotState};
use crate::types::{PeerId, Record, RecordKind};

/// Default capacity for the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A message the engine wants delivered
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Send on every open link, skipping `except` when set
    Broadcast {
        message: WireMessage,
        except: Option<PeerId>,
    },
    /// Send on one peer's link only
    SendTo { peer: PeerId, message: WireMessage },
}

impl Outbound {
    pub fn broadcast(message: WireMessage) -> Self {
        Outbound::Broadcast {
            message,
            except: None,
        }
    }

    pub fn send_to(peer: PeerId, message: WireMessage) -> Self {
        Outbound::SendTo { peer, message }
    }

    pub fn message(&self) -> &WireMessage {
        match self {
            Outbound::Broadcast { message, .. } | Outbound::SendTo { message, .. } => message,
        }
    }
}

/// Record versions this peer has already processed
///
/// Grows for the lifetime of the engine and is never pruned.
#[derive(Debug, Default)]
pub struct SeenSet {
    entries: HashSet<(String, ClockToken)>,
}

impl SeenSet {
    /// Mark a version seen, returning `true` if it was novel
    pub fn insert(&mut self, id: &str, clock: &ClockToken) -> bool {
        self.entries.insert((id.to_string(), clock.clone()))
    }

    pub fn contains(&self, id: &str, clock: &ClockToken) -> bool {
        self.entries.contains(&(id.to_string(), clock.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Gossip protocol state for one peer
pub struct GossipEngine<S: RecordStore> {
    local: PeerId,
    store: S,
    /// Live task records ordered by creation time
    records: Vec<Record>,
    seen: SeenSet,
    snapshot: SnapshotState,
    event_tx: broadcast::Sender<MeshEvent>,
}

impl<S: RecordStore> GossipEngine<S> {
    /// Create an engine over `store`, loading the current listing
    ///
    /// # Errors
    ///
    /// Returns an error if the initial listing cannot be read.
    pub fn new(local: PeerId, store: S) -> MeshResult<Self> {
        Self::with_capacity(local, store, EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(local: PeerId, store: S, event_capacity: usize) -> MeshResult<Self> {
        let (event_tx, _) = broadcast::channel(event_capacity.max(1));
        let mut engine = Self {
            local,
            store,
            records: Vec::new(),
            seen: SeenSet::default(),
            snapshot: SnapshotState::new(),
            event_tx,
        };
        engine.refresh()?;
        Ok(engine)
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    pub fn snapshot_state(&self) -> &SnapshotState {
        &self.snapshot
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<MeshEvent> {
        self.event_tx.clone()
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.event_tx.send(event);
    }

    fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit(MeshEvent::notice(level, message));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Listing
    // ═══════════════════════════════════════════════════════════════════════

    /// Live task records, oldest first
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn pending(&self) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(|r| !r.is_done())
    }

    pub fn done(&self) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(|r| r.is_done())
    }

    /// Greatest clock in the live listing, or the zero token when empty
    pub fn max_local_clock(&self) -> ClockToken {
        ClockToken::max_of(self.records.iter().map(|r| &r.clock), &self.local)
    }

    /// Rebuild the live listing from the store
    pub fn refresh(&mut self) -> MeshResult<()> {
        let mut live: Vec<Record> = self
            .store
            .list()?
            .into_iter()
            .filter(|r| r.kind == RecordKind::Task && !r.deleted)
            .collect();
        live.sort_by_key(|r| r.created_at);
        self.records = live;
        debug!(count = self.records.len(), "Refreshed listing");
        self.emit(MeshEvent::RecordsChanged {
            live: self.records.len(),
        });
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Local Mutations
    // ═══════════════════════════════════════════════════════════════════════

    /// The `hello` announced on every newly opened link
    pub fn hello(&self) -> WireMessage {
        WireMessage::Hello {
            from: self.local.clone(),
            to: None,
            max_clock: self.max_local_clock(),
        }
    }

    /// Persist a local version and build its broadcast
    ///
    /// Once the write lands the broadcast is always returned; a failed
    /// listing refresh is logged and retried on the next change.
    fn publish(&mut self, record: &Record) -> MeshResult<Outbound> {
        let out = Outbound::broadcast(WireMessage::doc(&record.exported(), false)?);
        self.store.put(record)?;
        self.seen.insert(&record.id, &record.clock);
        if let Err(e) = self.refresh() {
            error!(id = %record.id, error = %e, "Failed to refresh listing");
        }
        Ok(out)
    }

    /// Create a pending task and broadcast it
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub fn create_task(&mut self, text: &str) -> MeshResult<(Record, Vec<Outbound>)> {
        let record = Record::new_task(text, &self.local, ClockToken::generate(&self.local));
        let out = self.publish(&record)?;
        info!(id = %record.id, "Created task");
        self.notify(NoticeLevel::Success, format!("Added: “{}”", record.text));
        Ok((record, vec![out]))
    }

    /// Mark a task complete and broadcast the new version
    ///
    /// # Errors
    ///
    /// Returns `MeshError::NotFound` if no record with `id` is stored.
    pub fn complete_task(&mut self, id: &str) -> MeshResult<Vec<Outbound>> {
        let mut record = self.store.get(id)?;
        let clock = ClockToken::successor(&self.local, &record.clock);
        record.complete(&self.local, clock);
        let out = self.publish(&record)?;
        info!(%id, "Completed task");
        self.notify(NoticeLevel::Info, format!("Completed: “{}”", record.text));
        Ok(vec![out])
    }

    /// Tombstone a task and broadcast the deletion
    ///
    /// An id this peer has never stored still produces a minimal tombstone on
    /// the wire so peers holding it converge on the deletion.
    pub fn delete_task(&mut self, id: &str) -> MeshResult<Vec<Outbound>> {
        let mut record = match self.store.get(id) {
            Ok(record) => record,
            Err(MeshError::NotFound(_)) => {
                let tomb = Record::tombstone(id, ClockToken::generate(&self.local));
                self.seen.insert(&tomb.id, &tomb.clock);
                debug!(%id, "Broadcasting tombstone for unknown record");
                self.notify(NoticeLevel::Warning, format!("Deleted: “{}”", id));
                let doc = serde_json::json!({
                    "id": tomb.id,
                    "clock": tomb.clock,
                    "deleted": true,
                    "type": "task",
                });
                return Ok(vec![Outbound::broadcast(WireMessage::Doc {
                    doc,
                    silent: false,
                })]);
            }
            Err(e) => return Err(e),
        };

        let clock = ClockToken::successor(&self.local, &record.clock);
        record.mark_deleted(&self.local, clock);
        let out = self.publish(&record)?;
        info!(%id, "Deleted task");
        self.notify(NoticeLevel::Warning, format!("Deleted: “{}”", record.text));
        Ok(vec![out])
    }

    /// Run `op` for every id; a failing id is reported and skipped so the
    /// broadcasts of the others still go out
    fn apply_to_each<F>(&mut self, ids: Vec<String>, failure: &str, mut op: F) -> Vec<Outbound>
    where
        F: FnMut(&mut Self, &str) -> MeshResult<Vec<Outbound>>,
    {
        let mut out = Vec::new();
        for id in ids {
            match op(self, &id) {
                Ok(sent) => out.extend(sent),
                Err(e) => {
                    error!(%id, error = %e, "Bulk mutation failed for record");
                    self.notify(NoticeLevel::Error, failure);
                }
            }
        }
        out
    }

    /// Complete every task in `ids`, in order
    pub fn complete_many(&mut self, ids: &[String]) -> MeshResult<Vec<Outbound>> {
        Ok(self.apply_to_each(ids.to_vec(), "Error completing task", |engine, id| {
            engine.complete_task(id)
        }))
    }

    pub fn complete_all_pending(&mut self) -> MeshResult<Vec<Outbound>> {
        let ids = self.pending().map(|r| r.id.clone()).collect();
        Ok(self.apply_to_each(ids, "Error completing task", |engine, id| {
            engine.complete_task(id)
        }))
    }

    pub fn delete_all_pending(&mut self) -> MeshResult<Vec<Outbound>> {
        let ids = self.pending().map(|r| r.id.clone()).collect();
        Ok(self.apply_to_each(ids, "Error deleting task", |engine, id| engine.delete_task(id)))
    }

    pub fn delete_all_done(&mut self) -> MeshResult<Vec<Outbound>> {
        let ids = self.done().map(|r| r.id.clone()).collect();
        Ok(self.apply_to_each(ids, "Error deleting task", |engine, id| engine.delete_task(id)))
    }

    /// Wipe the local store and tell every peer to do the same
    pub fn clear_all(&mut self) -> MeshResult<Vec<Outbound>> {
        self.clear_local(None)?;
        Ok(vec![Outbound::broadcast(WireMessage::ClearAll {
            from: self.local.clone(),
            to: None,
        })])
    }

    fn clear_local(&mut self, by: Option<PeerId>) -> MeshResult<()> {
        self.store.clear()?;
        self.records.clear();
        warn!(by = ?by.as_ref().map(|p| p.as_str()), "Local store cleared");
        self.notify(NoticeLevel::Warning, "Local database cleared");
        self.emit(MeshEvent::StoreCleared { by });
        self.emit(MeshEvent::RecordsChanged { live: 0 });
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Resync
    // ═══════════════════════════════════════════════════════════════════════

    /// Manual resync: address a `hello` to each open peer, clear the snapshot
    /// guard and re-evaluate catch-up
    pub fn sync_with(&mut self, open_peers: &[PeerId]) -> Vec<Outbound> {
        info!(peers = open_peers.len(), "Manual handshake");
        let max_clock = self.max_local_clock();
        let mut out: Vec<Outbound> = open_peers
            .iter()
            .map(|peer| {
                Outbound::send_to(
                    peer.clone(),
                    WireMessage::Hello {
                        from: self.local.clone(),
                        to: Some(peer.clone()),
                        max_clock: max_clock.clone(),
                    },
                )
            })
            .collect();
        self.snapshot.reset();
        out.extend(self.maybe_request_snapshot());
        out
    }

    /// Addressed `clear:all` sent ahead of an authoritative snapshot push
    pub fn clear_for(&self, peer: &PeerId) -> Outbound {
        Outbound::send_to(
            peer.clone(),
            WireMessage::ClearAll {
                from: self.local.clone(),
                to: Some(peer.clone()),
            },
        )
    }

    /// Full snapshot of local task records addressed to `peer`
    pub fn snapshot_for(&self, peer: &PeerId) -> MeshResult<Outbound> {
        let records = produce_snapshot(&self.store)?;
        let count = records.len();
        let message = WireMessage::snapshot(self.local.clone(), peer.clone(), &records)?;
        debug!(to = %peer, count, "Sending snapshot");
        self.emit(MeshEvent::SnapshotSent {
            peer: peer.clone(),
            count,
        });
        self.notify(NoticeLevel::Info, format!("Snapshot sent ({})", count));
        Ok(Outbound::send_to(peer.clone(), message))
    }

    fn maybe_request_snapshot(&mut self) -> Option<Outbound> {
        let my_max = self.max_local_clock();
        match self.snapshot.evaluate(&my_max, self.records.is_empty()) {
            SnapshotDecision::Request { peer, reason } => {
                debug!(to = %peer, ?reason, my_max = %my_max, "Requesting snapshot");
                self.emit(MeshEvent::SnapshotRequested { peer: peer.clone() });
                Some(Outbound::send_to(
                    peer.clone(),
                    WireMessage::SnapshotRequest {
                        from: self.local.clone(),
                        to: peer,
                    },
                ))
            }
            decision => {
                debug!(?decision, "No snapshot request");
                None
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound
    // ═══════════════════════════════════════════════════════════════════════

    /// Process one raw frame received on `origin`'s link
    ///
    /// Malformed frames and failures while applying records are logged and
    /// otherwise dropped; inbound data never fails the caller.
    pub fn handle_frame(&mut self, origin: &PeerId, raw: &str) -> Vec<Outbound> {
        match WireMessage::decode(raw) {
            Ok(message) => self.handle_message(origin, message),
            Err(e) => {
                warn!(from = %origin, error = %e, "Invalid link message");
                Vec::new()
            }
        }
    }

    /// Process one decoded message received on `origin`'s link
    pub fn handle_message(&mut self, origin: &PeerId, message: WireMessage) -> Vec<Outbound> {
        if let Some(to) = message.to() {
            if *to != self.local {
                debug!(kind = message.kind(), %to, "Dropping message for another peer");
                return Vec::new();
            }
        }
        debug!(from = %origin, kind = message.kind(), "Link message");

        match message {
            WireMessage::Hello { from, max_clock, .. } => {
                self.snapshot.record_clock(from.clone(), max_clock);
                let reply = WireMessage::HelloReply {
                    from: self.local.clone(),
                    to: from.clone(),
                    max_clock: self.max_local_clock(),
                };
                let mut out = vec![Outbound::send_to(from, reply)];
                out.extend(self.maybe_request_snapshot());
                out
            }
            WireMessage::HelloReply { from, max_clock, .. } => {
                debug!(%from, %max_clock, "Hello reply");
                self.snapshot.record_clock(from, max_clock);
                self.maybe_request_snapshot().into_iter().collect()
            }
            WireMessage::SnapshotRequest { from, .. } => match self.snapshot_for(&from) {
                Ok(out) => vec![out],
                Err(e) => {
                    error!(to = %from, error = %e, "Failed to build snapshot");
                    self.notify(NoticeLevel::Error, "Error sending snapshot");
                    Vec::new()
                }
            },
            WireMessage::Snapshot { from, docs, .. } => self.handle_snapshot(origin, from, docs),
            WireMessage::Doc { doc, silent } => self.handle_doc(origin, doc, silent),
            WireMessage::ClearAll { from, .. } => {
                if let Err(e) = self.clear_local(Some(from.clone())) {
                    error!(error = %e, "Failed to clear local store");
                    self.notify(NoticeLevel::Error, "Error clearing database");
                } else {
                    self.notify(
                        NoticeLevel::Warning,
                        format!("Database cleared by {}", from.author_tag()),
                    );
                }
                Vec::new()
            }
            WireMessage::Unknown => Vec::new(),
        }
    }

    fn handle_doc(&mut self, origin: &PeerId, doc: Value, silent: bool) -> Vec<Outbound> {
        let record = match Record::from_wire(&doc) {
            Ok(record) => record,
            Err(MeshError::MissingClock(id)) => {
                debug!(%id, "Dropping doc without clock");
                return Vec::new();
            }
            Err(e) => {
                warn!(from = %origin, error = %e, "Dropping undecodable doc");
                return Vec::new();
            }
        };

        if !self.seen.insert(&record.id, &record.clock) {
            return Vec::new();
        }

        self.apply_remote(&record);

        if !silent {
            self.notify_remote(&record);
        }
        vec![Outbound::Broadcast {
            message: WireMessage::Doc { doc, silent },
            except: Some(origin.clone()),
        }]
    }

    fn handle_snapshot(&mut self, origin: &PeerId, from: PeerId, docs: Vec<Value>) -> Vec<Outbound> {
        let mut out = Vec::new();
        let mut applied = 0;
        for doc in docs {
            let record = match Record::from_wire(&doc) {
                Ok(record) => record,
                Err(e) => {
                    debug!(%from, error = %e, "Skipping snapshot entry");
                    continue;
                }
            };
            if !self.seen.insert(&record.id, &record.clock) {
                continue;
            }
            self.apply_remote(&record);
            applied += 1;
            out.push(Outbound::Broadcast {
                message: WireMessage::Doc { doc, silent: true },
                except: Some(origin.clone()),
            });
        }

        info!(%from, applied, "Snapshot processed");
        if applied > 0 {
            self.emit(MeshEvent::SnapshotApplied { from, applied });
            self.notify(
                NoticeLevel::Info,
                format!("Snapshot applied: {} change(s)", applied),
            );
        }
        out
    }

    fn apply_remote(&mut self, record: &Record) {
        let mut record = record.clone();
        record.kind = RecordKind::Task;
        match reconcile(&self.store, &record) {
            Ok(Resolution::Applied) => {
                if let Err(e) = self.refresh() {
                    error!(error = %e, "Failed to refresh listing");
                }
            }
            Ok(Resolution::Rejected) => {}
            Err(e) => {
                error!(id = %record.id, error = %e, "Failed to apply remote record");
                self.notify(NoticeLevel::Error, "Error applying remote");
            }
        }
    }

    fn notify_remote(&self, record: &Record) {
        let text = if record.text.is_empty() {
            record.id.as_str()
        } else {
            record.text.as_str()
        };
        let author = record.done_by.as_deref().unwrap_or(&record.created_by);
        let by = if author.is_empty() {
            String::new()
        } else {
            format!(" by {}", author)
        };
        let (level, verb) = if record.deleted {
            (NoticeLevel::Warning, "Deleted")
        } else if record.is_done() {
            (NoticeLevel::Info, "Completed")
        } else {
            (NoticeLevel::Success, "Added")
        };
        self.notify(level, format!("{}: “{}”{}", verb, text, by));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::now_millis;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Memory store that can refuse writes to one id and refuse listings
    struct FaultyStore {
        inner: MemoryStore,
        reject_put: Option<String>,
        reject_list: Arc<AtomicBool>,
    }

    impl FaultyStore {
        fn new(records: Vec<Record>, reject_put: Option<&str>) -> Self {
            Self {
                inner: MemoryStore::with_records(records),
                reject_put: reject_put.map(str::to_string),
                reject_list: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl RecordStore for FaultyStore {
        fn list(&self) -> Result<Vec<Record>, MeshError> {
            if self.reject_list.load(Ordering::SeqCst) {
                return Err(MeshError::Storage("listing unavailable".into()));
            }
            self.inner.list()
        }

        fn get(&self, id: &str) -> Result<Record, MeshError> {
            self.inner.get(id)
        }

        fn contains(&self, id: &str) -> Result<bool, MeshError> {
            self.inner.contains(id)
        }

        fn put(&self, record: &Record) -> Result<(), MeshError> {
            if self.reject_put.as_deref() == Some(record.id.as_str()) {
                return Err(MeshError::Storage(format!("write refused for {}", record.id)));
            }
            self.inner.put(record)
        }

        fn put_many(&self, records: &[Record]) -> Result<(), MeshError> {
            records.iter().try_for_each(|r| self.put(r))
        }

        fn clear(&self) -> Result<(), MeshError> {
            self.inner.clear()
        }
    }

    fn pending_task(id: &str, created_at: i64) -> Record {
        let author = PeerId::new("a");
        let mut record = Record::new_task(id, &author, ClockToken::new(10, "a"));
        record.id = id.to_string();
        record.created_at = created_at;
        record
    }

    fn doc_ids(out: &[Outbound]) -> Vec<String> {
        out.iter()
            .filter_map(|o| match o.message() {
                WireMessage::Doc { doc, .. } => doc["id"].as_str().map(str::to_string),
                _ => None,
            })
            .collect()
    }

    fn engine(id: &str) -> GossipEngine<MemoryStore> {
        GossipEngine::new(PeerId::new(id), MemoryStore::new()).unwrap()
    }

    fn doc_frame(id: &str, clock: &str, text: &str) -> String {
        json!({"t": "doc", "doc": {"id": id, "clock": clock, "text": text, "type": "task"}})
            .to_string()
    }

    #[test]
    fn test_create_marks_seen_and_broadcasts() {
        let mut e = engine("a");
        let (record, out) = e.create_task("Buy milk").unwrap();

        assert_eq!(e.records().len(), 1);
        assert!(e.seen().contains(&record.id, &record.clock));
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            Outbound::Broadcast { message: WireMessage::Doc { silent: false, .. }, except: None }
        ));
    }

    #[test]
    fn test_complete_missing_is_not_found() {
        let mut e = engine("a");
        assert!(matches!(e.complete_task("nope"), Err(MeshError::NotFound(_))));
    }

    #[test]
    fn test_delete_unknown_broadcasts_minimal_tombstone() {
        let mut e = engine("a");
        let out = e.delete_task("ghost").unwrap();
        let Outbound::Broadcast { message: WireMessage::Doc { doc, .. }, .. } = &out[0] else {
            panic!("expected doc broadcast");
        };
        assert_eq!(doc["id"], "ghost");
        assert_eq!(doc["deleted"], true);
        assert_eq!(doc["type"], "task");
        assert!(doc.get("text").is_none());
        assert!(e.store().is_empty());
    }

    #[test]
    fn test_delete_hides_from_listing() {
        let mut e = engine("a");
        let (record, _) = e.create_task("x").unwrap();
        e.delete_task(&record.id).unwrap();
        assert!(e.records().is_empty());
        assert!(e.store().get(&record.id).unwrap().deleted);
    }

    #[test]
    fn test_novel_doc_applied_and_forwarded_except_origin() {
        let mut e = engine("b");
        let origin = PeerId::new("a");
        let out = e.handle_frame(&origin, &doc_frame("x", "10:a", "hi"));

        assert_eq!(e.records().len(), 1);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Outbound::Broadcast { except: Some(p), .. } if *p == origin));
    }

    #[test]
    fn test_duplicate_doc_dropped() {
        let mut e = engine("b");
        let origin = PeerId::new("a");
        let frame = doc_frame("x", "10:a", "hi");
        assert_eq!(e.handle_frame(&origin, &frame).len(), 1);
        assert!(e.handle_frame(&PeerId::new("c"), &frame).is_empty());
    }

    #[test]
    fn test_rejected_but_novel_doc_still_forwarded() {
        let mut e = engine("b");
        let origin = PeerId::new("a");
        e.handle_frame(&origin, &doc_frame("x", "100:a", "new"));
        let out = e.handle_frame(&origin, &doc_frame("x", "50:c", "old"));
        assert_eq!(out.len(), 1);
        assert_eq!(e.store().get("x").unwrap().text, "new");
    }

    #[test]
    fn test_doc_without_clock_dropped() {
        let mut e = engine("b");
        let frame = json!({"t": "doc", "doc": {"id": "x", "text": "t"}}).to_string();
        assert!(e.handle_frame(&PeerId::new("a"), &frame).is_empty());
        assert!(e.seen().is_empty());
        assert!(e.store().is_empty());
    }

    #[test]
    fn test_malformed_frame_ignored() {
        let mut e = engine("b");
        assert!(e.handle_frame(&PeerId::new("a"), "{not json").is_empty());
        assert!(e.handle_frame(&PeerId::new("a"), r#"{"t":"mystery"}"#).is_empty());
    }

    #[test]
    fn test_message_for_other_peer_dropped() {
        let mut e = engine("b");
        let frame = json!({"t": "snapshot:request", "from": "a", "to": "c"}).to_string();
        assert!(e.handle_frame(&PeerId::new("a"), &frame).is_empty());
    }

    #[test]
    fn test_hello_replies_and_requests_when_empty() {
        let mut e = engine("b");
        let frame = json!({"t": "hello", "from": "a", "maxClock": "0:a"}).to_string();
        let out = e.handle_frame(&PeerId::new("a"), &frame);

        assert_eq!(out.len(), 2);
        assert!(matches!(out[0].message(), WireMessage::HelloReply { to, .. } if to.as_str() == "a"));
        assert!(matches!(out[1].message(), WireMessage::SnapshotRequest { to, .. } if to.as_str() == "a"));

        let again = e.handle_frame(&PeerId::new("a"), &frame);
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_snapshot_request_answered() {
        let mut e = engine("a");
        e.create_task("one").unwrap();
        let frame = json!({"t": "snapshot:request", "from": "b", "to": "a"}).to_string();
        let out = e.handle_frame(&PeerId::new("b"), &frame);
        let Outbound::SendTo { peer, message: WireMessage::Snapshot { docs, .. } } = &out[0] else {
            panic!("expected snapshot");
        };
        assert_eq!(peer.as_str(), "b");
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn test_snapshot_applies_novel_and_refloods_silently() {
        let mut e = engine("b");
        let frame = json!({
            "t": "snapshot", "from": "a", "to": "b",
            "docs": [
                {"id": "x", "clock": "1:a", "text": "one"},
                {"id": "y", "clock": "2:a", "text": "two", "deleted": true},
                {"id": "z", "text": "no clock"}
            ]
        })
        .to_string();
        let out = e.handle_frame(&PeerId::new("a"), &frame);
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .all(|o| matches!(o.message(), WireMessage::Doc { silent: true, .. })));
        assert_eq!(e.records().len(), 1);

        let again = e.handle_frame(&PeerId::new("a"), &frame);
        assert!(again.is_empty());
    }

    #[test]
    fn test_clear_all_wipes_store() {
        let mut e = engine("b");
        e.create_task("x").unwrap();
        let frame = json!({"t": "clear:all", "from": "a"}).to_string();
        e.handle_frame(&PeerId::new("a"), &frame);
        assert!(e.records().is_empty());
        assert!(e.store().is_empty());
    }

    #[test]
    fn test_sync_with_resets_guard() {
        let mut e = engine("b");
        let hello = json!({"t": "hello", "from": "a", "maxClock": "5:a"}).to_string();
        e.handle_frame(&PeerId::new("a"), &hello);
        assert!(e.snapshot_state().is_requested());

        let out = e.sync_with(&[PeerId::new("a")]);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0].message(), WireMessage::Hello { to: Some(_), .. }));
        assert!(matches!(out[1].message(), WireMessage::SnapshotRequest { .. }));
    }

    #[test]
    fn test_max_local_clock_ignores_tombstones() {
        let mut e = engine("a");
        assert_eq!(e.max_local_clock(), ClockToken::zero(&PeerId::new("a")));
        let (record, _) = e.create_task("x").unwrap();
        assert_eq!(e.max_local_clock(), record.clock);
        e.delete_task(&record.id).unwrap();
        assert_eq!(e.max_local_clock(), ClockToken::zero(&PeerId::new("a")));
    }

    #[test]
    fn test_remote_doc_notice() {
        let mut e = engine("b");
        let mut events = e.subscribe();
        let frame = json!({"t": "doc", "doc": {
            "id": "x", "clock": "1:a", "text": "Milk", "createdBy": "peer-abc"
        }})
        .to_string();
        e.handle_frame(&PeerId::new("a"), &frame);

        let mut notices = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let MeshEvent::Notice { message, .. } = event {
                notices.push(message);
            }
        }
        assert_eq!(notices, vec!["Added: “Milk” by peer-abc".to_string()]);
    }

    #[test]
    fn test_bulk_complete_skips_failing_record() {
        let records = vec![pending_task("r1", 1), pending_task("r2", 2), pending_task("r3", 3)];
        let store = FaultyStore::new(records, Some("r2"));
        let mut e = GossipEngine::new(PeerId::new("a"), store).unwrap();
        let mut events = e.subscribe();

        let out = e.complete_all_pending().unwrap();

        assert_eq!(doc_ids(&out), vec!["r1".to_string(), "r3".to_string()]);
        assert!(e.store().get("r1").unwrap().is_done());
        assert!(!e.store().get("r2").unwrap().is_done());
        assert!(e.store().get("r3").unwrap().is_done());

        let mut errors = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let MeshEvent::Notice { level: NoticeLevel::Error, message } = event {
                errors.push(message);
            }
        }
        assert_eq!(errors, vec!["Error completing task".to_string()]);
    }

    #[test]
    fn test_bulk_delete_skips_failing_record() {
        let store = FaultyStore::new(vec![pending_task("r1", 1), pending_task("r2", 2)], Some("r1"));
        let mut e = GossipEngine::new(PeerId::new("a"), store).unwrap();

        let out = e.delete_all_pending().unwrap();

        assert_eq!(doc_ids(&out), vec!["r2".to_string()]);
        assert!(e.store().get("r2").unwrap().deleted);
        assert_eq!(e.records().len(), 1);
    }

    #[test]
    fn test_write_still_broadcast_when_refresh_fails() {
        let store = FaultyStore::new(vec![pending_task("r1", 1)], None);
        let reject_list = store.reject_list.clone();
        let mut e = GossipEngine::new(PeerId::new("a"), store).unwrap();

        reject_list.store(true, Ordering::SeqCst);
        let out = e.complete_task("r1").unwrap();

        assert_eq!(doc_ids(&out), vec!["r1".to_string()]);
        let stored = e.store().get("r1").unwrap();
        assert!(stored.is_done());
        assert!(e.seen().contains("r1", &stored.clock));
    }

    #[test]
    fn test_local_mutation_outranks_applied_version() {
        let mut e = engine("peer-a");
        // A remote version stamped ahead of our wall clock by a peer that
        // also wins the tiebreak
        let ahead = ClockToken::new(now_millis() + 60_000, "peer-z");
        e.handle_frame(&PeerId::new("peer-z"), &doc_frame("x", &ahead.to_string(), "shared"));
        assert_eq!(e.store().get("x").unwrap().clock, ahead);

        e.complete_task("x").unwrap();
        let completed = e.store().get("x").unwrap().clock;
        assert!(completed > ahead);
        assert_eq!(completed.peer(), "peer-a");

        e.delete_task("x").unwrap();
        let deleted = e.store().get("x").unwrap();
        assert!(deleted.deleted);
        assert!(deleted.clock > completed);
    }

    #[test]
    fn test_local_mutation_wins_at_the_replaced_peer() {
        let mut a = engine("peer-a");
        let mut b = engine("peer-b");
        let (record, out) = b.create_task("shared").unwrap();
        let frame = out[0].message().encode().unwrap();
        a.handle_frame(b.local(), &frame);

        // Same-millisecond edits would tie on timestamp and lose to "peer-b"
        let out = a.delete_task(&record.id).unwrap();
        let frame = out[0].message().encode().unwrap();
        b.handle_frame(a.local(), &frame);

        assert!(b.store().get(&record.id).unwrap().deleted);
        assert_eq!(b.store().get(&record.id).unwrap(), a.store().get(&record.id).unwrap());
    }
}
