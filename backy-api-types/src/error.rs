//! Typed error hierarchy per the error handling design: integrity failures,
//! lock contention, remote-revision protection and configuration refusals
//! each get their own variant so callers can match on failure class instead
//! of parsing messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackyError {
    #[error("chunk {hash} failed hash verification: expected {expected}, got {actual}")]
    InconsistentHash {
        hash: String,
        expected: String,
        actual: String,
    },

    #[error("chunk backend failure: {0}")]
    Backend(String),

    #[error("failed to acquire exclusive lock on {0}")]
    LockContention(String),

    #[error("source not ready: {0}")]
    SourceNotReady(String),

    #[error("remote revisions disallowed: {0}")]
    RemoteRevisionModification(String),

    #[error("unknown tags not present in schedule: {0:?} (use --force to override)")]
    UnknownTags(Vec<String>),

    #[error("tag expectation failed for revision {0}")]
    TagExpectationFailed(String),

    #[error("revision not found: {0}")]
    RevisionNotFound(String),

    #[error("invalid revision selection expression: {0}")]
    InvalidSelection(String),

    #[error("invalid trust value: {0}")]
    InvalidTrust(String),

    #[error("peer {peer} unavailable: {reason}")]
    PeerUnavailable { peer: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BackyError>;
