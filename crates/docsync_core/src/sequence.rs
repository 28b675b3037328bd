//! Sequence allocation.

use crate::error::CoreResult;
use docsync_store::KvStore;
use std::sync::Arc;

/// Issues monotonically increasing sequence numbers for one collection.
///
/// Backed by an atomic counter in the store, so allocators on different
/// nodes sharing a store never hand out the same number. Allocation order
/// says nothing about when a sequence becomes visible in the cache.
#[derive(Clone)]
pub struct SequenceAllocator {
    store: Arc<dyn KvStore>,
    counter_key: String,
    unused_prefix: String,
}

impl SequenceAllocator {
    /// Creates an allocator for a collection.
    pub fn new(store: Arc<dyn KvStore>, collection: &str) -> Self {
        Self {
            store,
            counter_key: format!("_sync:seq:{collection}"),
            unused_prefix: unused_prefix(collection),
        }
    }

    /// Allocates the next sequence.
    pub fn next(&self) -> CoreResult<u64> {
        Ok(self.store.increment_counter(&self.counter_key, 1)?)
    }

    /// Returns the last allocated sequence without allocating.
    pub fn last(&self) -> CoreResult<u64> {
        Ok(self.store.counter(&self.counter_key)?)
    }

    /// Records that an allocated sequence will never carry a document.
    ///
    /// The marker lets caches on other nodes stop waiting for it.
    pub fn release_unused(&self, seq: u64) -> CoreResult<()> {
        let key = format!("{}{seq}", self.unused_prefix);
        self.store.set(&key, Vec::new())?;
        tracing::debug!(seq, "released unused sequence");
        Ok(())
    }

    /// Returns the store key prefix of unused-sequence markers.
    pub fn unused_key_prefix(&self) -> &str {
        &self.unused_prefix
    }
}

impl std::fmt::Debug for SequenceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceAllocator")
            .field("counter_key", &self.counter_key)
            .finish_non_exhaustive()
    }
}

pub(crate) fn unused_prefix(collection: &str) -> String {
    format!("_sync:unused:{collection}:")
}
