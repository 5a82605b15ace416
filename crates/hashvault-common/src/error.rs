//! Error types for Hashvault

use thiserror::Error;

/// Result type alias for Hashvault operations
pub type Result<T> = std::result::Result<T, HashvaultError>;

/// Main error type for Hashvault
#[derive(Error, Debug)]
pub enum HashvaultError {
    #[error("Invalid record: {0}")]
    Record(#[from] RecordError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl HashvaultError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Why a `HASH:COUNT` line was rejected.
///
/// Rejections are recovered locally: the line is dropped and counted as lost
/// input, never treated as fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("missing ':' delimiter")]
    MissingDelimiter,

    #[error("expected exactly one ':' delimiter")]
    TooManyFields,

    #[error("empty hash")]
    EmptyHash,

    #[error("hash contains non-hex characters")]
    InvalidHash,

    #[error("hash has length {actual}, expected {expected}")]
    HashLength { expected: usize, actual: usize },

    #[error("count is not a non-negative integer")]
    InvalidCount,

    #[error("count {0} does not fit in a BIGINT column")]
    CountOutOfRange(String),
}
