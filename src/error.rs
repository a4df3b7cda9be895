//! Error Module
//!
//! Defines the storage-layer error taxonomy and the single error type surfaced
//! at the repository boundary.

use thiserror::Error;

/// Storage-layer error for the locked document store
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    /// Retryable I/O failure (disk hiccup, share momentarily unavailable, partial read)
    #[error("Transient IO error: {0}")]
    TransientIo(String),

    /// Exclusive lock held by another writer
    #[error("Lock contention: {0}")]
    LockContention(String),

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: Box<StoreError>,
    },

    #[error("Document unavailable: {0}")]
    DocumentUnavailable(String),

    /// Content is not a valid document; recovered locally by reinitializing defaults
    #[error("Document corrupt: {0}")]
    DocumentCorrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether the retry policy should attempt the operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::TransientIo(_) | StoreError::LockContention(_)
        )
    }

    /// Whether lock contention is the underlying cause, looking through retry exhaustion
    pub fn is_lock_contention(&self) -> bool {
        match self {
            StoreError::LockContention(_) => true,
            StoreError::RetryExhausted { last_error, .. } => last_error.is_lock_contention(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for StoreError {
    fn from(err: serde_yaml::Error) -> Self {
        StoreError::Config(err.to_string())
    }
}

/// Result type alias for the storage layer
pub type Result<T> = std::result::Result<T, StoreError>;

/// Category of a repository-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryErrorKind {
    /// Another writer held the statistics files for the whole retry window
    Locked,
    /// Statistics files could not be read or written
    Unavailable,
}

/// The only error type that leaves the statistics repository
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct StatsRepositoryError {
    kind: RepositoryErrorKind,
    message: String,
    detail: String,
}

pub const LOCKED_MESSAGE: &str = "statistics file is temporarily locked, please try again";
pub const UNAVAILABLE_MESSAGE: &str = "statistics are temporarily unavailable, please try again";

impl StatsRepositoryError {
    pub fn kind(&self) -> RepositoryErrorKind {
        self.kind
    }

    /// User-facing message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Underlying storage error text, for logs
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl From<StoreError> for StatsRepositoryError {
    fn from(err: StoreError) -> Self {
        let (kind, message) = if err.is_lock_contention() {
            (RepositoryErrorKind::Locked, LOCKED_MESSAGE)
        } else {
            (RepositoryErrorKind::Unavailable, UNAVAILABLE_MESSAGE)
        };
        Self {
            kind,
            message: message.to_string(),
            detail: err.to_string(),
        }
    }
}
