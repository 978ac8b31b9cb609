//! Per-peer JSONL log files
//!
//! Several peers are often run side by side on one machine while testing a
//! mesh. Each peer appends to its own JSONL file so their logs never
//! interleave, and the files can be merged into one timeline afterwards.
//!
//! ## Layout
//!
//! ```text
//! logs/
//! ├── raw/                              # one file per peer per day
//! │   ├── 2026-10-17_peer-k3x.jsonl
//! │   └── 2026-10-17_peer-9qa.jsonl
//! └── sessions/                         # which peers ran together
//!     └── 2026-10-17T09-12-03.json
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use meshtask_core::logging::LoggingBuilder;
//!
//! LoggingBuilder::new("./logs", peer_id.author_tag())
//!     .with_filter("meshtask_core=debug")
//!     .init()?;
//! ```
//!
//! ```bash
//! # Every gossip decision one peer made
//! jq 'select(.target | startswith("meshtask_core::sync"))' logs/raw/*_peer-k3x.jsonl
//!
//! # Merged timeline
//! cat logs/raw/*.jsonl | jq -s 'sort_by(.ts)'
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::{JsonLogEntry, SessionMetadata};
pub use layer::{JsonlLayer, LoggingBuilder};
pub use writer::{entries_for_peer, read_all_entries, write_session_metadata, PeerLogWriter};
