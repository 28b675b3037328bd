//! Error types for docsync core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Why a requested revision cannot be supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnavailableReason {
    /// The document or revision never existed here.
    Missing,
    /// The revision was pruned beyond the retention window.
    Pruned,
    /// The document was purged.
    Purged,
    /// The document's revision tree is corrupt and quarantined.
    Corrupt,
    /// The requester lost access to every channel of the revision.
    Removed,
}

impl UnavailableReason {
    /// Returns the wire name of this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            UnavailableReason::Missing => "missing",
            UnavailableReason::Pruned => "pruned",
            UnavailableReason::Purged => "purged",
            UnavailableReason::Corrupt => "corrupt",
            UnavailableReason::Removed => "removed",
        }
    }

    /// Parses a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "missing" => Some(UnavailableReason::Missing),
            "pruned" => Some(UnavailableReason::Pruned),
            "purged" => Some(UnavailableReason::Purged),
            "corrupt" => Some(UnavailableReason::Corrupt),
            "removed" => Some(UnavailableReason::Removed),
            _ => None,
        }
    }

    /// HTTP-style status code reported alongside the reason.
    pub fn status_code(&self) -> u16 {
        match self {
            UnavailableReason::Missing => 404,
            UnavailableReason::Pruned | UnavailableReason::Purged => 410,
            UnavailableReason::Corrupt => 500,
            UnavailableReason::Removed => 403,
        }
    }
}

/// Errors that can occur in docsync core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Store collaborator error.
    #[error("store error: {0}")]
    Store(#[from] docsync_store::StoreError),

    /// Record or body (de)serialization failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Document not found.
    #[error("document not found: {doc_id}")]
    NotFound {
        /// The missing document.
        doc_id: String,
    },

    /// Collection not found.
    #[error("collection not found: {name}")]
    CollectionNotFound {
        /// Name of the collection.
        name: String,
    },

    /// A revision was added under a parent the tree does not contain.
    #[error("invalid parent {parent} for document {doc_id}")]
    InvalidParent {
        /// The document.
        doc_id: String,
        /// The parent revision that was not found.
        parent: String,
    },

    /// A revision ID could not be parsed.
    #[error("invalid revision id: {0}")]
    InvalidRevId(String),

    /// A supplied revision history is malformed.
    #[error("invalid revision history: {0}")]
    InvalidHistory(String),

    /// The write did not extend the current winning revision.
    #[error("document update conflict: {doc_id}")]
    RevisionConflict {
        /// The document.
        doc_id: String,
    },

    /// Compare-and-swap retries were exhausted.
    #[error("conflict writing {doc_id}: gave up after {attempts} attempts")]
    Conflict {
        /// The document.
        doc_id: String,
        /// How many attempts were made.
        attempts: u32,
    },

    /// The requested revision cannot be supplied.
    #[error("revision {rev} of {doc_id} unavailable: {}", reason.as_str())]
    RevisionUnavailable {
        /// The document.
        doc_id: String,
        /// The requested revision.
        rev: String,
        /// Why it is unavailable.
        reason: UnavailableReason,
    },

    /// The document's revision tree violates its invariants.
    #[error("revision tree corrupt for {doc_id}: {message}")]
    RevisionTreeCorrupt {
        /// The document.
        doc_id: String,
        /// Description of the corruption.
        message: String,
    },

    /// The stored checkpoint does not match the peer's claim.
    #[error("checkpoint mismatch for client {client}")]
    CheckpointMismatch {
        /// The replicator identity.
        client: String,
    },

    /// A sequence did not become visible in time.
    #[error("timed out waiting for sequence {sequence}")]
    SequenceTimeout {
        /// The awaited sequence.
        sequence: u64,
    },

    /// The waiting task was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoreError {
    /// Creates an encoding error from any displayable cause.
    pub fn encoding(cause: impl std::fmt::Display) -> Self {
        CoreError::Encoding(cause.to_string())
    }

    /// Returns true if the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Conflict { .. } | CoreError::SequenceTimeout { .. }
        )
    }

    /// HTTP-style status code for reporting the error to a peer.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::NotFound { .. } | CoreError::CollectionNotFound { .. } => 404,
            CoreError::RevisionConflict { .. }
            | CoreError::Conflict { .. }
            | CoreError::CheckpointMismatch { .. } => 409,
            CoreError::InvalidParent { .. }
            | CoreError::InvalidRevId(_)
            | CoreError::InvalidHistory(_)
            | CoreError::InvalidConfig(_) => 400,
            CoreError::RevisionUnavailable { reason, .. } => reason.status_code(),
            CoreError::SequenceTimeout { .. } => 408,
            CoreError::Cancelled => 499,
            CoreError::Store(_)
            | CoreError::Encoding(_)
            | CoreError::RevisionTreeCorrupt { .. } => 500,
        }
    }
}
