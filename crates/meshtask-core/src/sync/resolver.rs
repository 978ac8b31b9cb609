//! Last-writer-wins conflict resolution at whole-record granularity
//!
//! An incoming record replaces the stored one only when there is no stored
//! version or the incoming clock is strictly greater. Reapplying the same
//! version compares equal and is rejected, so `reconcile` is idempotent.
//! No event is emitted here; callers refresh and broadcast.

use std::cmp::Ordering;

use tracing::debug;

use crate::clock::compare;
use crate::error::{MeshError, MeshResult};
use crate::storage::RecordStore;
use crate::types::Record;

/// Outcome of reconciling a candidate against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Candidate replaced (or created) the stored record
    Applied,
    /// Stored record has an equal or newer clock
    Rejected,
}

impl Resolution {
    pub fn is_applied(&self) -> bool {
        matches!(self, Resolution::Applied)
    }
}

/// Reconcile `candidate` against the stored version of the same id.
///
/// A lookup miss counts as "no prior version". Any other store failure is
/// returned to the caller and the store is left untouched.
pub fn reconcile<S>(store: &S, candidate: &Record) -> MeshResult<Resolution>
where
    S: RecordStore + ?Sized,
{
    let local = match store.get(&candidate.id) {
        Ok(record) => Some(record),
        Err(MeshError::NotFound(_)) => None,
        Err(e) => return Err(e),
    };

    let wins = match &local {
        None => true,
        Some(local) => compare(&candidate.clock, &local.clock) == Ordering::Greater,
    };

    if wins {
        store.put(candidate)?;
        debug!(id = %candidate.id, clock = %candidate.clock, "Applied remote record");
        Ok(Resolution::Applied)
    } else {
        debug!(
            id = %candidate.id,
            remote = %candidate.clock,
            local = ?local.map(|r| r.clock.to_string()),
            "Skipped older record"
        );
        Ok(Resolution::Rejected)
    }
}
