//! Common Error Types for the Indexer
//!
//! Root error taxonomy shared by the ingestion pipeline, the periodic
//! tasks and the API layer.

use thiserror::Error;

use crate::storage::StorageError;
use crate::watcher::WatcherError;

/// Root error type for the indexer
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),

    /// Network or rate-limit failure talking to a chain provider
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// Unparseable log line, program-log fragment or transaction
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Negative balance or reconciliation drift beyond tolerance
    #[error("ledger consistency fault: {0}")]
    LedgerConsistency(String),

    /// Cursor advance past a range that is not durably stored
    #[error("cursor gap: {0}")]
    CursorGap(String),

    /// Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    /// Validation errors
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexerError {
    /// Create a transient provider error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientProvider(msg.into())
    }

    /// Create a malformed event error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEvent(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IndexerError::TransientProvider(_) | IndexerError::Storage(_) | IndexerError::Io(_)
        )
    }

    /// Get error code for API responses and structured logs
    pub fn error_code(&self) -> &'static str {
        match self {
            IndexerError::Config(_) => "CONFIG_ERROR",
            IndexerError::Logging(_) => "LOGGING_ERROR",
            IndexerError::TransientProvider(_) => "TRANSIENT_PROVIDER",
            IndexerError::MalformedEvent(_) => "MALFORMED_EVENT",
            IndexerError::LedgerConsistency(_) => "LEDGER_CONSISTENCY_FAULT",
            IndexerError::CursorGap(_) => "CURSOR_GAP",
            IndexerError::Storage(_) => "STORAGE_ERROR",
            IndexerError::Validation(_) => "VALIDATION_ERROR",
            IndexerError::Internal(_) => "INTERNAL_ERROR",
            IndexerError::Io(_) => "IO_ERROR",
        }
    }
}

impl From<StorageError> for IndexerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LedgerConsistency(msg) => IndexerError::LedgerConsistency(msg),
            StorageError::CursorGap(msg) => IndexerError::CursorGap(msg),
            other => IndexerError::Storage(other.to_string()),
        }
    }
}

impl From<WatcherError> for IndexerError {
    fn from(err: WatcherError) -> Self {
        match err {
            WatcherError::Transient(msg) => IndexerError::TransientProvider(msg),
            WatcherError::Malformed(msg) => IndexerError::MalformedEvent(msg),
            WatcherError::Permanent(msg) => IndexerError::Internal(msg),
        }
    }
}

/// Result type alias using IndexerError
pub type Result<T> = std::result::Result<T, IndexerError>;
