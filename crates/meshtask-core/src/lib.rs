//! Meshtask Core Library
//!
//! Serverless task sharing over a full mesh of peer links with gossip-based,
//! eventually consistent sync.
//!
//! ## Overview
//!
//! Every peer keeps its own record store. A change made anywhere floods to
//! every other peer over direct links and is resolved by last-writer-wins on
//! a per-record logical clock. Peers that start late or fall behind catch up
//! with one snapshot from the best-informed peer they have heard from. A
//! small relay introduces peers to each other and carries link negotiation;
//! it never sees a record.
//!
//! ## Core Principles
//!
//! - **Local-first**: mutations apply to the local store first
//! - **Flood with dedup**: each `(id, clock)` version is processed once
//! - **Total order**: clock tokens order by timestamp, then by peer id
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use meshtask_core::{MeshConfig, MeshNode, RelayClient, Storage, TcpConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MeshConfig::default();
//!     let store = Storage::new(config.db_path())?;
//!     let relay = RelayClient::connect(&config.relay_addr).await?;
//!     let node = MeshNode::spawn(&config, store, Arc::new(TcpConnector::default()), relay)?;
//!
//!     node.create_task("Build solar dehydrator").await?;
//!     node.sync_now().await?;
//!
//!     for task in node.list_tasks().await? {
//!         println!("{}: {}", if task.is_done() { "✓" } else { "○" }, task.text);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod mesh;
pub mod node;
pub mod relay;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use clock::ClockToken;
pub use config::MeshConfig;
pub use error::{MeshError, MeshResult};
pub use mesh::{
    is_initiator, Connection, Connector, LinkState, MemoryConnector, MemoryNetwork, MeshManager,
    PeerInfo, SignalPayload, TcpConnector,
};
pub use node::{MeshNode, NodeHandle};
pub use relay::{RelayClient, RelayFrame, RelayHub, RelayServer, SignalingChannel};
pub use storage::{MemoryStore, RecordStore, Storage};
pub use sync::{
    reconcile, GossipEngine, MeshEvent, NoticeLevel, Outbound, Resolution, SnapshotState,
    WireMessage, EVENT_CHANNEL_CAPACITY,
};
pub use types::*;
