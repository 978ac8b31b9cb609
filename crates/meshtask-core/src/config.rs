//! Node configuration
//!
//! Read from an optional JSON file; every field has a default so a file
//! only needs the values it changes. Command-line flags are applied on top
//! by the caller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};
use crate::sync::EVENT_CHANNEL_CAPACITY;
use crate::types::PeerId;

pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_RELAY_PORT: u16 = 3000;

/// `~/.meshtask/data`, or `./.meshtask/data` when there is no home directory
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".meshtask")
        .join("data")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Fixed peer identifier; a stored or freshly generated one is used when unset
    pub peer_id: Option<String>,
    /// Directory holding the record database
    pub data_dir: PathBuf,
    /// `host:port` of the signaling relay
    pub relay_addr: String,
    /// Host the TCP connector binds link listeners to
    pub listen_host: String,
    /// How long a manual sync waits for at least one open link
    pub link_wait_timeout_ms: u64,
    /// Poll interval while waiting for an open link
    pub link_poll_interval_ms: u64,
    /// Pause between `clear:all` and the snapshot in a forced push
    pub force_push_gap_ms: u64,
    pub event_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            data_dir: default_data_dir(),
            relay_addr: DEFAULT_RELAY_ADDR.to_string(),
            listen_host: "127.0.0.1".to_string(),
            link_wait_timeout_ms: 2000,
            link_poll_interval_ms: 100,
            force_push_gap_ms: 50,
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl MeshConfig {
    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Io` if the file cannot be read and
    /// `MeshError::Config` if it is not valid configuration JSON.
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| MeshError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the node cannot run with
    pub fn validate(&self) -> MeshResult<()> {
        if let Some(id) = &self.peer_id {
            if id.trim().is_empty() {
                return Err(MeshError::Config("peer_id must not be empty".into()));
            }
        }
        if self.link_poll_interval_ms == 0 {
            return Err(MeshError::Config("link_poll_interval_ms must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(MeshError::Config("event_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn fixed_peer_id(&self) -> Option<PeerId> {
        self.peer_id.as_deref().map(PeerId::new)
    }

    pub fn link_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.link_wait_timeout_ms)
    }

    pub fn link_poll_interval(&self) -> Duration {
        Duration::from_millis(self.link_poll_interval_ms)
    }

    pub fn force_push_gap(&self) -> Duration {
        Duration::from_millis(self.force_push_gap_ms)
    }

    /// Path of the record database inside `data_dir`
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("meshtask.redb")
    }
}
