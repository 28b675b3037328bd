//! Error types for store operations.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Compare-and-swap lost against a concurrent writer.
    #[error("CAS mismatch on key {key}: expected {expected}, found {actual}")]
    CasMismatch {
        /// The key being written.
        key: String,
        /// The CAS value the writer expected.
        expected: u64,
        /// The CAS value currently stored (0 if absent).
        actual: u64,
    },

    /// Create-only write found an existing value.
    #[error("key already exists: {0}")]
    KeyExists(String),

    /// The key does not exist.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The store is closed.
    #[error("store is closed")]
    Closed,

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns true if this is a lost CAS race.
    pub fn is_cas_mismatch(&self) -> bool {
        matches!(self, StoreError::CasMismatch { .. })
    }
}
