//! Error types for Cardvault
//!
//! This module defines the common error type used by the storage engine,
//! the bulk dataset pipeline and the TTL cache.

use thiserror::Error;

/// Common result type for Cardvault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Cardvault
#[derive(Debug, Error)]
pub enum Error {
    // Dataset errors
    #[error("chunk decode failed: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("partial dataset: {} of {total} chunks missing", .missing.len())]
    PartialDataset { missing: Vec<String>, total: usize },

    #[error("ingest of dataset {version} failed after {written}/{planned} chunks: {source}")]
    IngestFailed {
        version: String,
        written: usize,
        planned: usize,
        source: Box<Error>,
    },

    // Storage errors
    #[error("storage quota exceeded: required {required} bytes, available {available} of {budget} bytes")]
    QuotaExceeded {
        required: u64,
        available: u64,
        budget: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Encoding errors
    #[error("serialization error: {0}")]
    Serialization(String),

    // Caller errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error (or the error an ingest failed with) is quota exhaustion
    #[must_use]
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            Self::QuotaExceeded { .. } => true,
            Self::IngestFailed { source, .. } => source.is_quota_exceeded(),
            _ => false,
        }
    }

    /// Bytes the rejected write needed, for quota exhaustion errors
    #[must_use]
    pub const fn quota_required(&self) -> Option<u64> {
        match self {
            Self::QuotaExceeded { required, .. } => Some(*required),
            _ => None,
        }
    }

    /// Check if this error signals a degraded (partial) read
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        matches!(self, Self::PartialDataset { .. })
    }

    /// Check if this error means stored bytes could not be interpreted
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Decode(_) => true,
            Self::IngestFailed { source, .. } => source.is_corruption(),
            _ => false,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(format!("bincode: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(format!("json: {e}"))
    }
}
