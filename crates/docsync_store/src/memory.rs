//! In-memory store and index.

use crate::error::{StoreError, StoreResult};
use crate::index::{IndexRow, SecondaryIndex};
use crate::kv::{Cas, KvStore, Mutation, Versioned};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::trace;

/// An in-memory key-value store.
///
/// Suitable for:
/// - Unit and integration tests
/// - Embedded deployments that replicate from a durable peer
///
/// # Thread Safety
///
/// All operations take an internal lock and may be called from any thread.
/// Subscribers are notified while the write lock is held, so notification
/// order matches write order.
///
/// # Example
///
/// ```rust
/// use docsync_store::{KvStore, MemoryStore};
///
/// let store = MemoryStore::new();
/// let first = store.compare_and_swap("k", 0, b"v1".to_vec()).unwrap();
/// assert!(store.compare_and_swap("k", 0, b"v2".to_vec()).is_err());
/// store.compare_and_swap("k", first, b"v2".to_vec()).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Versioned>>,
    counters: Mutex<HashMap<String, u64>>,
    next_cas: AtomicU64,
    subscribers: Mutex<Vec<Sender<Mutation>>>,
    injected_cas_failures: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` compare-and-swap calls fail as if a concurrent
    /// writer had won the race.
    pub fn inject_cas_failures(&self, count: usize) {
        self.injected_cas_failures.store(count, Ordering::SeqCst);
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Returns all keys starting with `prefix`, sorted.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .data
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn allocate_cas(&self) -> Cas {
        self.next_cas.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_cas_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn publish(&self, mutation: Mutation) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(mutation.clone()).is_ok());
    }

    fn write_locked(
        &self,
        data: &mut HashMap<String, Versioned>,
        key: &str,
        value: Vec<u8>,
    ) -> Cas {
        let cas = self.allocate_cas();
        data.insert(
            key.to_string(),
            Versioned {
                value: value.clone(),
                cas,
            },
        );
        self.publish(Mutation {
            key: key.to_string(),
            value: Some(value),
            cas,
        });
        cas
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> StoreResult<Cas> {
        let mut data = self.data.write();
        Ok(self.write_locked(&mut data, key, value))
    }

    fn add(&self, key: &str, value: Vec<u8>) -> StoreResult<Cas> {
        let mut data = self.data.write();
        if data.contains_key(key) {
            return Err(StoreError::KeyExists(key.to_string()));
        }
        Ok(self.write_locked(&mut data, key, value))
    }

    fn compare_and_swap(&self, key: &str, expected: Cas, value: Vec<u8>) -> StoreResult<Cas> {
        let mut data = self.data.write();
        let actual = data.get(key).map_or(0, |v| v.cas);

        if self.take_injected_failure() {
            trace!(key, expected, "injected CAS failure");
            return Err(StoreError::CasMismatch {
                key: key.to_string(),
                expected,
                actual: actual.max(expected.saturating_add(1)),
            });
        }

        if actual != expected {
            return Err(StoreError::CasMismatch {
                key: key.to_string(),
                expected,
                actual,
            });
        }
        Ok(self.write_locked(&mut data, key, value))
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let mut data = self.data.write();
        if data.remove(key).is_some() {
            self.publish(Mutation {
                key: key.to_string(),
                value: None,
                cas: 0,
            });
        }
        Ok(())
    }

    fn increment_counter(&self, key: &str, delta: u64) -> StoreResult<u64> {
        let mut counters = self.counters.lock();
        let counter = counters.entry(key.to_string()).or_insert(0);
        *counter = counter
            .checked_add(delta)
            .ok_or_else(|| StoreError::Backend(format!("counter {key} overflowed")))?;
        Ok(*counter)
    }

    fn counter(&self, key: &str) -> StoreResult<u64> {
        Ok(self.counters.lock().get(key).copied().unwrap_or(0))
    }

    fn subscribe(&self) -> Receiver<Mutation> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

/// An in-memory channel index.
///
/// Rows are kept per channel in a `BTreeMap` keyed by `(sequence, doc_id)`,
/// which gives ordered range scans for backfill.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    channels: RwLock<HashMap<String, BTreeMap<(u64, String), IndexRow>>>,
    queries: AtomicU64,
}

impl MemoryIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many queries have been served.
    #[must_use]
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Returns the number of rows stored for a channel.
    #[must_use]
    pub fn channel_len(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map_or(0, BTreeMap::len)
    }
}

impl SecondaryIndex for MemoryIndex {
    fn insert(&self, channel: &str, row: IndexRow) -> StoreResult<()> {
        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .insert((row.sequence, row.doc_id.clone()), row);
        Ok(())
    }

    fn query(
        &self,
        channel: &str,
        since: u64,
        until: u64,
        limit: usize,
    ) -> StoreResult<Vec<IndexRow>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if until <= since {
            return Ok(Vec::new());
        }
        let channels = self.channels.read();
        let Some(rows) = channels.get(channel) else {
            return Ok(Vec::new());
        };
        let start = (since.saturating_add(1), String::new());
        let iter = rows
            .range(start..)
            .take_while(|((seq, _), _)| *seq <= until)
            .map(|(_, row)| row.clone());
        Ok(if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        })
    }

    fn remove_doc(&self, channel: &str, doc_id: &str) -> StoreResult<usize> {
        let mut channels = self.channels.write();
        let Some(rows) = channels.get_mut(channel) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|(_, id), _| id != doc_id);
        Ok(before - rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(sequence: u64, doc_id: &str) -> IndexRow {
        IndexRow {
            sequence,
            doc_id: doc_id.to_string(),
            rev_id: "1-abc".to_string(),
            deleted: false,
            removed: false,
        }
    }

    #[test]
    fn set_and_get() {
        let store = MemoryStore::new();
        assert!(store.get("a").unwrap().is_none());

        let cas = store.set("a", vec![1, 2, 3]).unwrap();
        let got = store.get("a").unwrap().unwrap();
        assert_eq!(got.value, vec![1, 2, 3]);
        assert_eq!(got.cas, cas);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn cas_requires_matching_version() {
        let store = MemoryStore::new();
        let first = store.compare_and_swap("doc", 0, vec![1]).unwrap();

        let err = store.compare_and_swap("doc", 0, vec![2]).unwrap_err();
        assert!(err.is_cas_mismatch());

        let second = store.compare_and_swap("doc", first, vec![2]).unwrap();
        assert_ne!(first, second);
        assert_eq!(store.get("doc").unwrap().unwrap().value, vec![2]);
    }

    #[test]
    fn add_is_create_only() {
        let store = MemoryStore::new();
        store.add("x", vec![1]).unwrap();
        assert_eq!(
            store.add("x", vec![2]),
            Err(StoreError::KeyExists("x".into()))
        );
    }

    #[test]
    fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.inject_cas_failures(2);
        assert!(store.compare_and_swap("k", 0, vec![1]).is_err());
        assert!(store.compare_and_swap("k", 0, vec![1]).is_err());
        assert!(store.compare_and_swap("k", 0, vec![1]).is_ok());
    }

    #[test]
    fn counters_are_monotonic() {
        let store = MemoryStore::new();
        assert_eq!(store.counter("seq").unwrap(), 0);
        assert_eq!(store.increment_counter("seq", 1).unwrap(), 1);
        assert_eq!(store.increment_counter("seq", 5).unwrap(), 6);
        assert_eq!(store.counter("seq").unwrap(), 6);
    }

    #[test]
    fn subscribers_see_mutations_in_order() {
        let store = MemoryStore::new();
        let rx = store.subscribe();

        store.set("a", vec![1]).unwrap();
        store.set("b", vec![2]).unwrap();
        store.delete("a").unwrap();

        let keys: Vec<(String, bool)> = rx
            .try_iter()
            .map(|m| (m.key, m.value.is_some()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a".to_string(), true),
                ("b".to_string(), true),
                ("a".to_string(), false)
            ]
        );
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let store = MemoryStore::new();
        drop(store.subscribe());
        store.set("a", vec![1]).unwrap();
        assert!(store.subscribers.lock().is_empty());
    }

    #[test]
    fn index_range_query() {
        let index = MemoryIndex::new();
        for seq in [3, 1, 7, 5] {
            index.insert("ch", row(seq, &format!("doc{seq}"))).unwrap();
        }

        let rows = index.query("ch", 1, 5, 0).unwrap();
        let seqs: Vec<u64> = rows.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![3, 5]);

        let limited = index.query("ch", 0, 100, 2).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].sequence, 1);

        assert!(index.query("other", 0, 100, 0).unwrap().is_empty());
        assert_eq!(index.query_count(), 3);
    }

    #[test]
    fn index_insert_is_idempotent() {
        let index = MemoryIndex::new();
        index.insert("ch", row(4, "a")).unwrap();
        index.insert("ch", row(4, "a")).unwrap();
        assert_eq!(index.channel_len("ch"), 1);
    }

    #[test]
    fn index_remove_doc() {
        let index = MemoryIndex::new();
        index.insert("ch", row(1, "a")).unwrap();
        index.insert("ch", row(2, "b")).unwrap();
        index.insert("ch", row(3, "a")).unwrap();

        assert_eq!(index.remove_doc("ch", "a").unwrap(), 2);
        assert_eq!(index.channel_len("ch"), 1);
    }
}
