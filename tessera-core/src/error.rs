use crate::meta::{PartitionKey, PartitionState};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TesseraError>;

#[derive(Error, Debug)]
pub enum TesseraError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Partition {partition} unavailable (state: {state})")]
    PartitionUnavailable {
        partition: PartitionKey,
        state: PartitionState,
    },

    #[error("Partition {partition} is not hosted on this node")]
    PartitionNotHosted { partition: PartitionKey },

    #[error("Failed to consume record at offset {offset} of {partition}: {reason}")]
    Consumption {
        partition: PartitionKey,
        offset: u64,
        reason: String,
    },

    #[error("Blob transfer error: {0}")]
    Transfer(String),

    #[error("Content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Node already started")]
    AlreadyStarted,

    #[error("Illegal state transition for {partition}: {from} -> {to}")]
    InvalidStateTransition {
        partition: PartitionKey,
        from: PartitionState,
        to: PartitionState,
    },

    #[error("Failed to stop services {failed:?}: {first}")]
    ShutdownFailed {
        failed: Vec<String>,
        #[source]
        first: Box<TesseraError>,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Storage faults worth another attempt with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            TesseraError::Io(_) | TesseraError::Storage(_) => true,
            TesseraError::Database(error) => matches!(
                error.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy)
                    | Some(rusqlite::ErrorCode::DatabaseLocked)
                    | Some(rusqlite::ErrorCode::SystemIoFailure)
                    | Some(rusqlite::ErrorCode::DiskFull)
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TesseraError::NotFound(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            TesseraError::PartitionUnavailable { .. } | TesseraError::PartitionNotHosted { .. }
        )
    }
}

pub(crate) fn lock_poisoned(what: &str) -> TesseraError {
    TesseraError::Internal(format!("{} lock poisoned", what))
}
