//! Error types for Meshtask

use thiserror::Error;

/// Main error type for Meshtask operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// Record was not found in the store
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Inbound payload could not be parsed
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Record arrived without a clock token
    #[error("Record has no clock: {0}")]
    MissingClock(String),

    /// Clock token string is not `<timestamp>:<peerId>`
    #[error("Invalid clock token: {0}")]
    InvalidClock(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Remote description or candidate could not be applied
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Link transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Signaling relay failure
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// The node task has exited and no longer accepts commands
    #[error("Node has stopped")]
    NodeStopped,
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

/// Result type alias using MeshError
pub type MeshResult<T> = Result<T, MeshError>;
