//! Error types for the history ledger

use crate::checksum::ChecksumError;

/// Ledger error
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Entry rejected before append
    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    /// A loaded log is structurally broken (not a checksum mismatch)
    #[error("malformed ledger: {0}")]
    Malformed(String),

    /// Snapshot or export (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bad checksum or key material
    #[error("checksum error: {0}")]
    Checksum(#[from] ChecksumError),
}
