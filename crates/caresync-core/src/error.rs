//! Error types for caresync-core

use thiserror::Error;

/// Result type alias using caresync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in caresync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Transport or server-availability failure; retryable, drives backoff
    #[error("Network error: {0}")]
    Network(String),

    /// Server asked us to slow down; the delay overrides computed backoff
    #[error("Rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: i64 },

    /// Local validation failure; non-retryable, change is never queued
    #[error("Validation error: {0}")]
    Validation(String),

    /// Version mismatch detected at push time; routed to the resolver
    #[error("Conflict on {entity_type} {entity_local_id}: base version {base_version} != server version {server_version}")]
    Conflict {
        entity_type: String,
        entity_local_id: String,
        base_version: i64,
        server_version: i64,
    },

    /// Authentication failure; pauses all sync without consuming retry budget
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Local persistence failure or corruption
    #[error("Storage error: {0}")]
    Storage(String),

    /// Payload cannot be encrypted or decrypted; the record is quarantined
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the sync engine may retry the failed operation later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}
