use marksync_core::PatchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote document is over the storage provider's size limit, so
    /// only part of it was returned.
    #[error("remote document is too large: {0}")]
    TruncatedRemote(String),

    #[error("could not apply local changes to the remote snapshot: {0}")]
    PatchApply(#[from] PatchError),

    #[error("sync is already running")]
    ConcurrentSync,

    /// A collaborator (remote store, state store, live tree) failed.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),

    #[error("invalid {what} snapshot: {source}")]
    InvalidSnapshot {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl SyncError {
    /// Whether a failed local-changes replay can be set aside instead of
    /// failing the attempt.
    pub fn is_replay_failure(&self) -> bool {
        match self {
            SyncError::PatchApply(_) => true,
            SyncError::InvalidSnapshot { what, .. } => *what == "patched",
            _ => false,
        }
    }
}
