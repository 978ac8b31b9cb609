//! Full-state catch-up layered on the gossip protocol
//!
//! Peers announce their highest clock in `hello`/`helloReply`. A peer whose
//! listing is empty, or whose own highest clock is behind the best announced
//! one, asks that peer for a snapshot exactly once. The guard stays set until
//! a manual resync resets it. Applying snapshots relies only on idempotent
//! last-writer-wins resolution, so duplicate or out-of-order snapshots are
//! harmless.

use std::cmp::Ordering;

use crate::clock::{compare, ClockToken};
use crate::error::MeshResult;
use crate::storage::RecordStore;
use crate::types::{PeerId, Record, RecordKind};

/// Why a snapshot request is issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestReason {
    /// The local listing has no records
    Empty,
    /// The chosen peer announced a greater clock than ours
    Behind,
}

/// Outcome of evaluating whether to request a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotDecision {
    /// Send one `snapshot:request` to `peer`
    Request { peer: PeerId, reason: RequestReason },
    /// A request was already issued and the guard is still set
    AlreadyRequested,
    /// No peer has announced a clock yet
    NoPeers,
    /// The local peer is caught up with the best announced clock
    UpToDate,
}

/// Per-peer announced clocks plus the request guard
#[derive(Debug, Default)]
pub struct SnapshotState {
    /// Announced clocks in first-announcement order
    remote_clocks: Vec<(PeerId, ClockToken)>,
    requested: bool,
}

impl SnapshotState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the clock a peer announced, replacing any earlier announcement
    pub fn record_clock(&mut self, peer: PeerId, clock: ClockToken) {
        match self.remote_clocks.iter_mut().find(|(p, _)| *p == peer) {
            Some(entry) => entry.1 = clock,
            None => self.remote_clocks.push((peer, clock)),
        }
    }

    pub fn remote_clock(&self, peer: &PeerId) -> Option<&ClockToken> {
        self.remote_clocks
            .iter()
            .find(|(p, _)| p == peer)
            .map(|(_, c)| c)
    }

    /// Peer with the greatest announced clock; ties go to the first announced
    pub fn best_peer(&self) -> Option<(&PeerId, &ClockToken)> {
        let mut best: Option<(&PeerId, &ClockToken)> = None;
        for (peer, clock) in &self.remote_clocks {
            match best {
                Some((_, best_clock)) if compare(clock, best_clock) != Ordering::Greater => {}
                _ => best = Some((peer, clock)),
            }
        }
        best
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    /// Clear the guard so the next evaluation may request again
    pub fn reset(&mut self) {
        self.requested = false;
    }

    /// Decide whether to request a snapshot, setting the guard when so.
    ///
    /// `local_max` is the greatest clock across the local listing and
    /// `local_empty` whether that listing has no records.
    pub fn evaluate(&mut self, local_max: &ClockToken, local_empty: bool) -> SnapshotDecision {
        if self.requested {
            return SnapshotDecision::AlreadyRequested;
        }
        let Some((peer, best_clock)) = self.best_peer() else {
            return SnapshotDecision::NoPeers;
        };

        let reason = if local_empty {
            RequestReason::Empty
        } else if compare(best_clock, local_max) == Ordering::Greater {
            RequestReason::Behind
        } else {
            return SnapshotDecision::UpToDate;
        };

        let peer = peer.clone();
        self.requested = true;
        SnapshotDecision::Request { peer, reason }
    }
}

/// Every stored task record, tombstones included, with defaults filled in
pub fn produce_snapshot<S>(store: &S) -> MeshResult<Vec<Record>>
where
    S: RecordStore + ?Sized,
{
    Ok(store
        .list()?
        .iter()
        .filter(|r| r.kind == RecordKind::Task)
        .map(Record::exported)
        .collect())
}
