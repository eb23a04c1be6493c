//! Error types for sync operations

use crate::BlockHeight;

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Which server-reported value disagreed with the local expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchKind {
    /// Remote chain name does not match the configured network
    ChainName,
    /// Remote consensus branch id does not match the local one
    BranchId,
    /// Remote sapling activation height does not match the local one
    SaplingActivation,
}

impl std::fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChainName => write!(f, "chain name"),
            Self::BranchId => write!(f, "consensus branch id"),
            Self::SaplingActivation => write!(f, "sapling activation height"),
        }
    }
}

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration, bad storage path or similar. Not retryable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection-level failure talking to the remote node
    #[error("Connection error: {0}")]
    Connection(String),

    /// Remote call timed out
    #[error("Connection timeout")]
    Timeout,

    /// The server answers for a different chain than the one configured.
    /// Requires reconfiguration, never retried automatically.
    #[error("Server mismatch on {kind}: expected `{expected}`, found `{found}`")]
    ServerMismatch {
        /// Value that disagreed
        kind: MismatchKind,
        /// Locally expected value
        expected: String,
        /// Value reported by the server
        found: String,
    },

    /// Chain continuity broke at the given height. Recovered internally by
    /// rewinding, does not consume the transient retry budget.
    #[error("Chain validation failed at height {height}")]
    ChainValidation {
        /// Height of the first block whose previous-hash did not match
        height: BlockHeight,
    },

    /// The automatic retry budget is exhausted; only `start(retry: true)`
    /// clears this condition.
    #[error("Max attempts reached after {0} retries")]
    MaxAttemptsReached(u32),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Rewind could not be performed
    #[error("Rewind error: {0}")]
    Rewind(String),

    /// Generic service failure, treated as transient
    #[error("Service error: {0}")]
    Service(String),

    /// Operation cancelled
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the failure should be retried with backoff.
    ///
    /// Chain validation errors are recoverable but routed through the reorg
    /// handler rather than the retry timer, so they count as non-retryable
    /// here.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout | Self::Service(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
