//! Mesh event types for notifying consumers about sync activity
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  MeshEvent: Notifications about mesh activity                   │
//! │  ├── Notice: user-visible message (added/completed/deleted...)  │
//! │  ├── RecordsChanged: the live listing was refreshed             │
//! │  ├── LinkStateChanged: a peer link moved through its lifecycle  │
//! │  ├── SnapshotRequested / SnapshotSent / SnapshotApplied         │
//! │  └── StoreCleared: local store was wiped                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use crate::mesh::LinkState;
use crate::types::PeerId;

/// Severity of a user-visible notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Info,
    Warning,
    Error,
}

impl fmt::Display for NoticeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoticeLevel::Success => write!(f, "success"),
            NoticeLevel::Info => write!(f, "info"),
            NoticeLevel::Warning => write!(f, "warning"),
            NoticeLevel::Error => write!(f, "error"),
        }
    }
}

/// Events emitted by a mesh node
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// Transient user-facing notification
    Notice { level: NoticeLevel, message: String },
    /// The in-memory listing was rebuilt from the store
    RecordsChanged {
        /// Number of live (non-deleted) records
        live: usize,
    },
    /// A peer link changed state
    LinkStateChanged { peer: PeerId, state: LinkState },
    /// A snapshot request was sent to `peer`
    SnapshotRequested { peer: PeerId },
    /// A snapshot with `count` records was sent to `peer`
    SnapshotSent { peer: PeerId, count: usize },
    /// A snapshot from `from` contributed `applied` novel records
    SnapshotApplied { from: PeerId, applied: usize },
    /// The local store was wiped, by a remote peer when `by` is set
    StoreCleared { by: Option<PeerId> },
}

impl MeshEvent {
    pub fn notice(level: NoticeLevel, message: impl Into<String>) -> Self {
        MeshEvent::Notice {
            level,
            message: message.into(),
        }
    }

    /// Peer this event concerns, if any
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            MeshEvent::LinkStateChanged { peer, .. }
            | MeshEvent::SnapshotRequested { peer }
            | MeshEvent::SnapshotSent { peer, .. } => Some(peer),
            MeshEvent::SnapshotApplied { from, .. } => Some(from),
            MeshEvent::StoreCleared { by } => by.as_ref(),
            MeshEvent::Notice { .. } | MeshEvent::RecordsChanged { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_level_display() {
        assert_eq!(NoticeLevel::Success.to_string(), "success");
        assert_eq!(NoticeLevel::Warning.to_string(), "warning");
    }

    #[test]
    fn test_event_peer() {
        let peer = PeerId::new("p1");
        let event = MeshEvent::SnapshotRequested { peer: peer.clone() };
        assert_eq!(event.peer(), Some(&peer));

        let event = MeshEvent::notice(NoticeLevel::Info, "hi");
        assert_eq!(event.peer(), None);

        let event = MeshEvent::StoreCleared { by: None };
        assert_eq!(event.peer(), None);
    }
}
