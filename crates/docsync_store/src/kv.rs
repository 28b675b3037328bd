//! Key-value store trait definition.

use crate::error::StoreResult;
use std::sync::mpsc::Receiver;

/// Opaque version stamp returned by every write.
///
/// A CAS of `0` never identifies a stored value; passing it to
/// [`KvStore::compare_and_swap`] means "the key must not exist yet".
pub type Cas = u64;

/// A stored value together with its current CAS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Raw value bytes.
    pub value: Vec<u8>,
    /// Version stamp of this value.
    pub cas: Cas,
}

/// A change notification emitted after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// The key that changed.
    pub key: String,
    /// New value, or `None` for a deletion.
    pub value: Option<Vec<u8>>,
    /// CAS of the new value (0 for deletions).
    pub cas: Cas,
}

/// The key-value store the engine persists documents, revision bodies,
/// attachments and checkpoints into.
///
/// # Invariants
///
/// - Every successful write returns a CAS distinct from the previous one
/// - `compare_and_swap` succeeds only if the stored CAS equals `expected`
/// - `increment_counter` is atomic across all callers
/// - Subscribers receive every mutation in the order it was applied
pub trait KvStore: Send + Sync {
    /// Reads a value.
    fn get(&self, key: &str) -> StoreResult<Option<Versioned>>;

    /// Unconditionally writes a value.
    fn set(&self, key: &str, value: Vec<u8>) -> StoreResult<Cas>;

    /// Writes a value only if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::KeyExists`] if a value is present.
    fn add(&self, key: &str, value: Vec<u8>) -> StoreResult<Cas>;

    /// Writes a value only if the current CAS matches `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::CasMismatch`] when another writer won.
    fn compare_and_swap(&self, key: &str, expected: Cas, value: Vec<u8>) -> StoreResult<Cas>;

    /// Removes a key. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// Atomically adds `delta` to a counter and returns the new value.
    ///
    /// Counters start at zero.
    fn increment_counter(&self, key: &str, delta: u64) -> StoreResult<u64>;

    /// Reads a counter without changing it.
    fn counter(&self, key: &str) -> StoreResult<u64>;

    /// Subscribes to the mutation feed.
    fn subscribe(&self) -> Receiver<Mutation>;
}
