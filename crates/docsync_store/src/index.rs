//! Secondary channel index.

use crate::error::StoreResult;

/// One row of the channel index.
///
/// Rows mirror change-cache entries: a document became visible in (or was
/// removed from) a channel at a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    /// Sequence of the mutation.
    pub sequence: u64,
    /// Document key.
    pub doc_id: String,
    /// Winning revision at that sequence.
    pub rev_id: String,
    /// Whether the winning revision is a tombstone.
    pub deleted: bool,
    /// Whether the document left the channel at this sequence.
    pub removed: bool,
}

/// Query surface of the secondary index used for backfill.
pub trait SecondaryIndex: Send + Sync {
    /// Records a row for `channel`.
    ///
    /// Inserting the same `(channel, sequence, doc_id)` twice is idempotent.
    fn insert(&self, channel: &str, row: IndexRow) -> StoreResult<()>;

    /// Returns rows with `since < sequence <= until`, ordered by sequence.
    ///
    /// A `limit` of zero means unlimited.
    fn query(&self, channel: &str, since: u64, until: u64, limit: usize)
        -> StoreResult<Vec<IndexRow>>;

    /// Removes every row for a document in `channel` (purge).
    fn remove_doc(&self, channel: &str, doc_id: &str) -> StoreResult<usize>;
}
