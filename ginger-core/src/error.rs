//! Error taxonomy shared by the client and server halves.

use crate::keypath::KeyPath;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SyncError {
    /// Transport unavailable or request timed out. Always transient.
    #[error("network error: {0}")]
    Network(String),

    #[error("user {user_id} may not {right} {key_path}")]
    Authorization {
        user_id: String,
        right: String,
        key_path: KeyPath,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("item {id} already present in {key_path}")]
    DuplicateInsert { key_path: KeyPath, id: String },

    #[error("reference {ref_id} does not resolve in {key_path}")]
    InvalidReference { key_path: KeyPath, ref_id: String },

    #[error("queue blocked at entry {sequence}: {reason}")]
    QueueBlocked { sequence: u64, reason: String },

    /// The store accepted a write but the rights bookkeeping that follows it failed.
    #[error("rights update failed after write to {key_path}: {reason}")]
    RightsUpdateFailed { key_path: KeyPath, reason: String },

    #[error("document {cid} released more times than retained")]
    DoubleRelease { cid: String },

    #[error("document {cid} already persisted as {id}")]
    AlreadyPersisted { cid: String, id: String },

    #[error("cache entry of {size} bytes exceeds the {max} byte cache")]
    EntryTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Transient errors leave a queued mutation in place for a later retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    /// Permanent errors will fail identically on every retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SyncError::Authorization { .. }
                | SyncError::NotFound(_)
                | SyncError::DuplicateInsert { .. }
                | SyncError::InvalidReference { .. }
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}
