//! Gossip-based synchronization layer
//!
//! ## Overview
//!
//! Each peer keeps a local record store and floods every record change to
//! all peers it has an open link to. Versions are compared by clock token
//! and the greatest one wins. Peers that join late, or fall behind, catch up
//! with a one-shot snapshot from the best-informed peer they have heard from.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  GossipEngine                                                   │
//! │  ├── SeenSet (id, clock) dedup that terminates flooding         │
//! │  ├── reconcile() last-writer-wins against the RecordStore       │
//! │  ├── SnapshotState (announced clocks + one-shot request guard)  │
//! │  └── Outbound instructions (broadcast / send to one peer)       │
//! │                                                                 │
//! │  MeshEvent broadcast channel for UIs and tests                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! - **hello / helloReply**: exchange highest known clocks
//! - **snapshot:request / snapshot**: full-state catch-up
//! - **doc**: one record version, flooded and deduplicated
//! - **clear:all**: administrative wipe of every receiver's store

pub mod events;
pub mod gossip;
pub mod protocol;
pub mod resolver;
pub mod snapshot;

pub use events::{MeshEvent, NoticeLevel};
pub use gossip::{GossipEngine, Outbound, SeenSet, EVENT_CHANNEL_CAPACITY};
pub use protocol::WireMessage;
pub use resolver::{reconcile, Resolution};
pub use snapshot::{produce_snapshot, RequestReason, SnapshotDecision, SnapshotState};
