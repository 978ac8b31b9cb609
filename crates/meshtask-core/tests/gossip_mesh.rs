//! Gossip engine behavior across a simulated full mesh
//!
//! Engines are wired together by an in-test router that delivers frames in
//! FIFO order, so these tests are deterministic and need no runtime.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use meshtask_core::{
    ClockToken, GossipEngine, MemoryStore, Outbound, PeerId, Record, RecordStore, WireMessage,
};

// ============================================================================
// Test Utilities
// ============================================================================

struct Frame {
    from: PeerId,
    to: PeerId,
    raw: String,
}

struct SimMesh {
    engines: HashMap<PeerId, GossipEngine<MemoryStore>>,
    stores: HashMap<PeerId, MemoryStore>,
    links: BTreeSet<(PeerId, PeerId)>,
    queue: VecDeque<Frame>,
    delivered: Vec<(PeerId, PeerId, String)>,
}

impl SimMesh {
    fn new() -> Self {
        Self {
            engines: HashMap::new(),
            stores: HashMap::new(),
            links: BTreeSet::new(),
            queue: VecDeque::new(),
            delivered: Vec::new(),
        }
    }

    fn add_peer(&mut self, id: &str, records: Vec<Record>) -> PeerId {
        let peer = PeerId::new(id);
        let store = MemoryStore::with_records(records);
        let engine = GossipEngine::new(peer.clone(), store.clone()).unwrap();
        self.engines.insert(peer.clone(), engine);
        self.stores.insert(peer.clone(), store);
        peer
    }

    fn engine(&mut self, peer: &PeerId) -> &mut GossipEngine<MemoryStore> {
        self.engines.get_mut(peer).unwrap()
    }

    fn store(&self, peer: &PeerId) -> &MemoryStore {
        &self.stores[peer]
    }

    fn key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
        if a < b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    fn connected(&self, a: &PeerId, b: &PeerId) -> bool {
        self.links.contains(&Self::key(a, b))
    }

    /// Open a link without the hello exchange
    fn link_quietly(&mut self, a: &PeerId, b: &PeerId) {
        self.links.insert(Self::key(a, b));
    }

    /// Open a link; both sides announce themselves as a real link would
    fn link(&mut self, a: &PeerId, b: &PeerId) {
        self.link_quietly(a, b);
        let hello_a = self.engine(a).hello();
        let hello_b = self.engine(b).hello();
        self.route(a, vec![Outbound::send_to(b.clone(), hello_a)]);
        self.route(b, vec![Outbound::send_to(a.clone(), hello_b)]);
    }

    fn link_all(&mut self, peers: &[PeerId], quietly: bool) {
        for (i, a) in peers.iter().enumerate() {
            for b in &peers[i + 1..] {
                if quietly {
                    self.link_quietly(a, b);
                } else {
                    self.link(a, b);
                }
            }
        }
    }

    fn neighbours(&self, peer: &PeerId) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self
            .engines
            .keys()
            .filter(|other| *other != peer && self.connected(peer, other))
            .cloned()
            .collect();
        out.sort();
        out
    }

    fn route(&mut self, from: &PeerId, outbound: Vec<Outbound>) {
        for out in outbound {
            let raw = out.message().encode().unwrap();
            match out {
                Outbound::Broadcast { except, .. } => {
                    for to in self.neighbours(from) {
                        if Some(&to) != except.as_ref() {
                            self.queue.push_back(Frame {
                                from: from.clone(),
                                to,
                                raw: raw.clone(),
                            });
                        }
                    }
                }
                Outbound::SendTo { peer, .. } => {
                    if self.connected(from, &peer) {
                        self.queue.push_back(Frame {
                            from: from.clone(),
                            to: peer,
                            raw,
                        });
                    }
                }
            }
        }
    }

    /// Deliver until quiet
    fn run(&mut self) {
        while let Some(frame) = self.queue.pop_front() {
            assert!(self.delivered.len() < 10_000, "gossip did not terminate");
            self.delivered
                .push((frame.from.clone(), frame.to.clone(), frame.raw.clone()));
            let out = self.engine(&frame.to).handle_frame(&frame.from, &frame.raw);
            self.route(&frame.to, out);
        }
    }

    fn delivered_of_kind(&self, kind: &str) -> Vec<(PeerId, PeerId)> {
        self.delivered
            .iter()
            .filter(|(_, _, raw)| WireMessage::decode(raw).unwrap().kind() == kind)
            .map(|(from, to, _)| (from.clone(), to.clone()))
            .collect()
    }
}

fn record(id: &str, ts: u64, peer: &str, text: &str) -> Record {
    let author = PeerId::new(peer);
    let mut record = Record::new_task(text, &author, ClockToken::new(ts, peer));
    record.id = id.to_string();
    record
}

// ============================================================================
// Flooding
// ============================================================================

#[test]
fn test_flood_terminates_in_full_mesh() {
    let mut mesh = SimMesh::new();
    let peers: Vec<PeerId> = ["p1", "p2", "p3", "p4"]
        .iter()
        .map(|id| mesh.add_peer(id, Vec::new()))
        .collect();
    mesh.link_all(&peers, true);

    let (created, out) = mesh.engine(&peers[0]).create_task("water plants").unwrap();
    mesh.route(&peers[0], out);
    mesh.run();

    // 3 first-hand deliveries, then each receiver forwards to its 2 other links
    let n = peers.len();
    assert_eq!(mesh.delivered_of_kind("doc").len(), (n - 1) + (n - 1) * (n - 2));

    for peer in &peers {
        let engine = mesh.engine(peer);
        assert_eq!(engine.seen().len(), 1);
        assert!(engine.seen().contains(&created.id, &created.clock));
        assert_eq!(engine.records().len(), 1);
        assert_eq!(engine.records()[0].text, "water plants");
    }
}

#[test]
fn test_mutations_converge_across_mesh() {
    let mut mesh = SimMesh::new();
    let peers: Vec<PeerId> = ["p1", "p2", "p3"]
        .iter()
        .map(|id| mesh.add_peer(id, Vec::new()))
        .collect();
    mesh.link_all(&peers, true);

    let (first, out) = mesh.engine(&peers[0]).create_task("first").unwrap();
    mesh.route(&peers[0], out);
    let (second, out) = mesh.engine(&peers[1]).create_task("second").unwrap();
    mesh.route(&peers[1], out);
    mesh.run();

    // Later mutations must carry a later timestamp than the creations
    std::thread::sleep(Duration::from_millis(5));

    let out = mesh.engine(&peers[2]).complete_task(&first.id).unwrap();
    mesh.route(&peers[2], out);
    let out = mesh.engine(&peers[0]).delete_task(&second.id).unwrap();
    mesh.route(&peers[0], out);
    mesh.run();

    let reference = mesh.store(&peers[0]).list().unwrap();
    assert_eq!(reference.len(), 2);
    for peer in &peers[1..] {
        assert_eq!(mesh.store(peer).list().unwrap(), reference);
    }
    for peer in &peers {
        let live = mesh.engine(peer).records().to_vec();
        assert_eq!(live.len(), 1);
        assert!(live[0].is_done());
    }
}

#[test]
fn test_unknown_delete_still_converges() {
    let mut mesh = SimMesh::new();
    let a = mesh.add_peer("p1", Vec::new());
    let b = mesh.add_peer("p2", vec![record("x", 10, "p2", "only on b")]);
    mesh.link_quietly(&a, &b);

    let out = mesh.engine(&a).delete_task("x").unwrap();
    mesh.route(&a, out);
    mesh.run();

    assert!(mesh.store(&b).get("x").unwrap().deleted);
    assert!(!mesh.store(&a).contains("x").unwrap());
    assert!(mesh.engine(&b).records().is_empty());
}

// ============================================================================
// Conflict Scenarios
// ============================================================================

#[test]
fn test_newer_version_beats_stale_tombstone() {
    let mut mesh = SimMesh::new();
    let a = mesh.add_peer("A", vec![record("x", 100, "A", "keep me")]);
    let mut stale = record("x", 50, "B", "keep me");
    stale.deleted = true;
    let b = mesh.add_peer("B", vec![stale.clone()]);

    mesh.link(&a, &b);
    mesh.run();

    // B's stale tombstone reaching A is rejected
    let tomb = WireMessage::doc(&stale, false).unwrap().encode().unwrap();
    let out = mesh.engine(&a).handle_frame(&b, &tomb);
    mesh.route(&a, out);
    mesh.run();

    for peer in [&a, &b] {
        let stored = mesh.store(peer).get("x").unwrap();
        assert!(!stored.deleted, "{} lost the record", peer);
        assert_eq!(stored.clock, ClockToken::new(100, "A"));
    }
    assert_eq!(mesh.engine(&b).records().len(), 1);
}

#[test]
fn test_empty_peer_catches_up_with_one_request() {
    let mut mesh = SimMesh::new();
    let a = mesh.add_peer(
        "A",
        vec![
            record("r1", 10, "A", "one"),
            record("r2", 20, "A", "two"),
            record("r3", 30, "A", "three"),
        ],
    );
    let c = mesh.add_peer("C", Vec::new());

    mesh.link(&a, &c);
    mesh.run();

    assert_eq!(mesh.delivered_of_kind("snapshot:request"), vec![(c.clone(), a.clone())]);
    assert_eq!(mesh.delivered_of_kind("snapshot").len(), 1);
    assert_eq!(
        mesh.store(&c).list().unwrap(),
        mesh.store(&a).list().unwrap()
    );
    assert_eq!(mesh.engine(&c).records().len(), 3);
    assert!(mesh.engine(&c).snapshot_state().is_requested());
}

#[test]
fn test_behind_peer_requests_from_best_informed() {
    let mut mesh = SimMesh::new();
    let a = mesh.add_peer("A", vec![record("r1", 10, "A", "old")]);
    let b = mesh.add_peer("B", vec![record("r1", 10, "A", "old")]);
    let c = mesh.add_peer(
        "C",
        vec![record("r1", 10, "A", "old"), record("r2", 90, "C", "new")],
    );

    mesh.link(&a, &b);
    mesh.run();
    assert!(mesh.delivered_of_kind("snapshot:request").is_empty());

    mesh.link(&a, &c);
    mesh.run();

    assert_eq!(mesh.delivered_of_kind("snapshot:request"), vec![(a.clone(), c.clone())]);
    assert!(mesh.store(&a).contains("r2").unwrap());
    // Snapshot entries are re-flooded silently to A's other links
    assert!(mesh.store(&b).contains("r2").unwrap());
}

#[test]
fn test_clear_all_wipes_every_peer() {
    let mut mesh = SimMesh::new();
    let peers: Vec<PeerId> = ["p1", "p2", "p3"]
        .iter()
        .map(|id| mesh.add_peer(id, vec![record("r1", 10, "p1", "shared")]))
        .collect();
    mesh.link_all(&peers, true);

    let out = mesh.engine(&peers[1]).clear_all().unwrap();
    mesh.route(&peers[1], out);
    mesh.run();

    for peer in &peers {
        assert!(mesh.store(peer).is_empty());
        assert!(mesh.engine(peer).records().is_empty());
    }
}

#[test]
fn test_force_push_replaces_peer_state() {
    let mut mesh = SimMesh::new();
    let a = mesh.add_peer("A", vec![record("mine", 10, "A", "authoritative")]);
    let b = mesh.add_peer("B", vec![record("theirs", 20, "B", "local only")]);
    mesh.link_quietly(&a, &b);

    let clear = mesh.engine(&a).clear_for(&b);
    mesh.route(&a, vec![clear]);
    mesh.run();
    let snapshot = mesh.engine(&a).snapshot_for(&b).unwrap();
    mesh.route(&a, vec![snapshot]);
    mesh.run();

    assert_eq!(mesh.store(&b).list().unwrap(), mesh.store(&a).list().unwrap());
}
