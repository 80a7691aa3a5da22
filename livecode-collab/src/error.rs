//! Coordinator error taxonomy.

use crate::protocol::{DocumentId, ErrorCode, ReplicaId};
use crate::replica::ReplicaError;
use crate::storage::StoreError;

/// Why a session request was not carried out.
///
/// Only `NotFound`, `LoadTimeout`, `Store`, `ReplicaInUse` and `Closed` are
/// reported to the requesting connection. The rest are dropped and logged.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Document not found: {0}")]
    NotFound(DocumentId),
    #[error("Timed out loading document {0}")]
    LoadTimeout(DocumentId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Connection has not joined a room")]
    NotMember,
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{kind} of {size} bytes exceeds limit of {limit}")]
    Oversize {
        kind: &'static str,
        size: usize,
        limit: usize,
    },
    #[error("Malformed {kind}: {reason}")]
    Malformed { kind: &'static str, reason: String },
    #[error("Replica id {0} is already in use in this room")]
    ReplicaInUse(ReplicaId),
    #[error("Room is closing")]
    Closed,
}

impl SessionError {
    /// Wire category for errors that are reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::NotFound(_) => ErrorCode::NotFound,
            SessionError::LoadTimeout(_) | SessionError::Store(_) => ErrorCode::Unavailable,
            SessionError::Closed => ErrorCode::Closing,
            SessionError::NotMember
            | SessionError::Forbidden(_)
            | SessionError::Oversize { .. }
            | SessionError::Malformed { .. }
            | SessionError::ReplicaInUse(_) => ErrorCode::Rejected,
        }
    }

    /// Whether the requester is told about this error.
    pub fn is_reported(&self) -> bool {
        matches!(
            self,
            SessionError::NotFound(_)
                | SessionError::LoadTimeout(_)
                | SessionError::Store(_)
                | SessionError::ReplicaInUse(_)
                | SessionError::Closed
        )
    }
}

impl From<ReplicaError> for SessionError {
    fn from(e: ReplicaError) -> Self {
        SessionError::Malformed {
            kind: "change",
            reason: e.to_string(),
        }
    }
}
