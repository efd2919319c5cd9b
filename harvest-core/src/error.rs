//! Error types for the harvest pipeline.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for harvest operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Main error type shared by the server and the agent.
#[derive(Error, Debug)]
pub enum HarvestError {
    // Client-input errors
    #[error("malformed metric: {reason}")]
    Malformed { reason: String },

    #[error("not found")]
    NotFound,

    #[error("metric {id} already registered as {existing}")]
    Conflict { id: String, existing: String },

    // Backend errors
    #[error("operation not supported by this backend: {operation}")]
    Unsupported { operation: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("transient failure: {reason}")]
    Transient { reason: String },

    // Middleware rejections
    #[error("rejected: {reason}")]
    Rejected { reason: String },

    // Startup errors
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("snapshot error at {path:?}: {reason}")]
    Snapshot { path: PathBuf, reason: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Crypto errors
    #[error("signature mismatch")]
    BadSignature,

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HarvestError {
    /// Create a Malformed error from any displayable reason.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed { reason: reason.into() }
    }

    /// Create a Transient error from any displayable reason.
    pub fn transient(reason: impl std::fmt::Display) -> Self {
        Self::Transient { reason: reason.to_string() }
    }
}

impl From<sqlx::Error> for HarvestError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}
