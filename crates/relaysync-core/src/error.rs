//! Error types for the relay synchronization engine

use thiserror::Error;

/// Main error type for relay sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration rejected before a cycle could start
    #[error("Configuration error: {0}")]
    Config(String),

    /// The relay directory could not be read
    #[error("Relay directory error: {0}")]
    Directory(String),

    /// Relay was not found in the directory
    #[error("Relay not found: {0}")]
    RelayNotFound(String),

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

    /// Relay transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Event sink failure
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

/// Failures talking to a relay
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not establish the connection
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    /// Connect or query did not complete in time
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Connection dropped mid-exchange
    #[error("connection reset: {0}")]
    Reset(String),

    /// The relay refused the subscription
    #[error("subscription closed by relay: {0}")]
    Refused(String),

    /// Frame could not be understood
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Proxy handshake failed
    #[error("proxy error: {0}")]
    Proxy(String),
}

impl TransportError {
    /// Whether retrying the same query may succeed
    ///
    /// Refusals and protocol violations are deterministic on the relay side,
    /// so retrying them only burns the relay's time budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. }
                | TransportError::Timeout(_)
                | TransportError::Reset(_)
                | TransportError::Proxy(_)
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => TransportError::Timeout("io"),
            ErrorKind::InvalidData => TransportError::Protocol(err.to_string()),
            _ => TransportError::Reset(err.to_string()),
        }
    }
}

/// Failures writing to an event sink
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The backing store rejected or failed the write
    #[error("write failed: {0}")]
    Write(String),

    /// The sink has been closed
    #[error("sink closed")]
    Closed,
}

impl From<SyncError> for SinkError {
    fn from(err: SyncError) -> Self {
        SinkError::Write(err.to_string())
    }
}

/// Reasons an individual relay item is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ItemError {
    /// Payload is not a JSON event object
    #[error("not an event object: {0}")]
    Shape(String),

    /// A hex field has the wrong length or alphabet
    #[error("bad {field}: expected {expected} hex chars")]
    BadHex { field: &'static str, expected: usize },

    /// The id does not match the event content
    #[error("id mismatch: claimed {claimed}, computed {computed}")]
    IdMismatch { claimed: String, computed: String },
}
