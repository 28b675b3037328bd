//! Per-channel change cache.

use crate::error::CoreResult;
use docsync_store::{IndexRow, SecondaryIndex};
use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One entry of a channel's change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Sequence of the mutation.
    pub sequence: u64,
    /// Document ID.
    pub doc_id: String,
    /// Winning revision at that sequence.
    pub rev_id: String,
    /// Whether the revision is a tombstone.
    pub deleted: bool,
    /// Whether the document left the channel at this sequence.
    pub removed: bool,
}

impl ChangeEntry {
    /// Converts the entry into an index row.
    pub fn to_row(&self) -> IndexRow {
        IndexRow {
            sequence: self.sequence,
            doc_id: self.doc_id.clone(),
            rev_id: self.rev_id.clone(),
            deleted: self.deleted,
            removed: self.removed,
        }
    }
}

impl From<IndexRow> for ChangeEntry {
    fn from(row: IndexRow) -> Self {
        Self {
            sequence: row.sequence,
            doc_id: row.doc_id,
            rev_id: row.rev_id,
            deleted: row.deleted,
            removed: row.removed,
        }
    }
}

/// Orders entries by sequence, drops repeated sequences and keeps only the
/// newest entry for each document.
///
/// Both the live and the backfill read paths go through this.
pub fn collapse(mut entries: Vec<ChangeEntry>) -> Vec<ChangeEntry> {
    entries.sort_by_key(|e| e.sequence);
    entries.dedup_by_key(|e| e.sequence);

    let mut seen = HashSet::new();
    let mut out: Vec<ChangeEntry> = entries
        .into_iter()
        .rev()
        .filter(|e| seen.insert(e.doc_id.clone()))
        .collect();
    out.reverse();
    out
}

#[derive(Debug)]
struct ChannelState {
    /// Sorted by sequence, no duplicates.
    entries: VecDeque<ChangeEntry>,
    /// The cache holds every entry with `sequence >= valid_from`.
    valid_from: u64,
}

/// Bounded, sequence-ordered window of one channel's changes.
///
/// Older entries are evicted oldest-first; reads that start before the
/// window are completed from the secondary index.
pub struct ChannelCache {
    name: String,
    max_length: usize,
    index: Arc<dyn SecondaryIndex>,
    state: RwLock<ChannelState>,
    evictions: AtomicU64,
    backfill_queries: AtomicU64,
}

impl ChannelCache {
    /// Creates a cache that is complete from `valid_from` onwards.
    pub fn new(
        name: impl Into<String>,
        max_length: usize,
        valid_from: u64,
        index: Arc<dyn SecondaryIndex>,
    ) -> Self {
        Self {
            name: name.into(),
            max_length: max_length.max(1),
            index,
            state: RwLock::new(ChannelState {
                entries: VecDeque::new(),
                valid_from,
            }),
            evictions: AtomicU64::new(0),
            backfill_queries: AtomicU64::new(0),
        }
    }

    /// Returns the channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Returns the lowest sequence the cache is complete from.
    pub fn valid_from(&self) -> u64 {
        self.state.read().valid_from
    }

    /// Returns the number of evicted entries.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Returns the number of index queries issued for backfill.
    pub fn backfill_queries(&self) -> u64 {
        self.backfill_queries.load(Ordering::Relaxed)
    }

    /// Inserts an entry in sequence order.
    ///
    /// Late arrivals are placed where they belong rather than appended.
    /// Returns false if the sequence is already cached or lies before the
    /// window (the index already serves it).
    pub fn add(&self, entry: ChangeEntry) -> bool {
        let mut state = self.state.write();
        if entry.sequence < state.valid_from {
            tracing::debug!(
                channel = %self.name,
                seq = entry.sequence,
                "entry predates cache window"
            );
            return false;
        }

        let at_end = state
            .entries
            .back()
            .map_or(true, |last| last.sequence < entry.sequence);
        if at_end {
            state.entries.push_back(entry);
        } else {
            match state
                .entries
                .binary_search_by_key(&entry.sequence, |e| e.sequence)
            {
                Ok(_) => return false,
                Err(pos) => state.entries.insert(pos, entry),
            }
        }

        while state.entries.len() > self.max_length {
            if let Some(evicted) = state.entries.pop_front() {
                state.valid_from = evicted.sequence + 1;
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        true
    }

    /// Drops every cached entry for a document.
    pub fn remove_doc(&self, doc_id: &str) -> usize {
        let mut state = self.state.write();
        let before = state.entries.len();
        state.entries.retain(|e| e.doc_id != doc_id);
        before - state.entries.len()
    }

    /// Returns the cached entries with `from < sequence <= until`, or
    /// `None` if part of that range has been evicted.
    pub fn cached_since(&self, from: u64, until: u64) -> Option<Vec<ChangeEntry>> {
        let state = self.state.read();
        if from.saturating_add(1) < state.valid_from {
            return None;
        }
        Some(collapse(Self::window(&state, from, until)))
    }

    fn window(state: &ChannelState, from: u64, until: u64) -> Vec<ChangeEntry> {
        let start = state.entries.partition_point(|e| e.sequence <= from);
        state
            .entries
            .range(start..)
            .take_while(|e| e.sequence <= until)
            .cloned()
            .collect()
    }

    /// Reads entries with `from < sequence <= until` from the index.
    pub fn backfill_from(&self, from: u64, until: u64) -> CoreResult<Vec<ChangeEntry>> {
        self.backfill_queries.fetch_add(1, Ordering::Relaxed);
        let rows = self.index.query(&self.name, from, until, 0)?;
        tracing::debug!(
            channel = %self.name,
            from,
            until,
            rows = rows.len(),
            "backfilled from index"
        );
        Ok(collapse(rows.into_iter().map(ChangeEntry::from).collect()))
    }

    /// Returns a lazy stream of entries with `from < sequence <= until`.
    ///
    /// Nothing is read until the stream is first polled. The portion of
    /// the range older than the window is served from the index.
    pub fn since(self: &Arc<Self>, from: u64, until: u64) -> ChangesSince {
        ChangesSince {
            cache: Arc::clone(self),
            last: from,
            until,
            buffer: None,
            error: None,
        }
    }

    fn snapshot(&self, from: u64, until: u64) -> CoreResult<Vec<ChangeEntry>> {
        let (valid_from, cached) = {
            let state = self.state.read();
            (state.valid_from, Self::window(&state, from, until))
        };

        let mut entries = Vec::with_capacity(cached.len());
        if from.saturating_add(1) < valid_from {
            let backfill_until = until.min(valid_from - 1);
            self.backfill_queries.fetch_add(1, Ordering::Relaxed);
            let rows = self.index.query(&self.name, from, backfill_until, 0)?;
            entries.extend(rows.into_iter().map(ChangeEntry::from));
        }
        entries.extend(cached);
        Ok(collapse(entries))
    }
}

impl std::fmt::Debug for ChannelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCache")
            .field("name", &self.name)
            .field("max_length", &self.max_length)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Lazy, finite stream returned by [`ChannelCache::since`].
///
/// Call [`ChangesSince::restart`] to resume from the last yielded
/// sequence after new entries arrive.
#[derive(Debug)]
pub struct ChangesSince {
    cache: Arc<ChannelCache>,
    last: u64,
    until: u64,
    buffer: Option<VecDeque<ChangeEntry>>,
    error: Option<crate::error::CoreError>,
}

impl ChangesSince {
    /// Returns the sequence of the last yielded entry (or the start).
    pub fn cursor(&self) -> u64 {
        self.last
    }

    /// Returns the upper bound of the stream.
    pub fn until(&self) -> u64 {
        self.until
    }

    /// Restarts after the last yielded entry with a new upper bound.
    pub fn restart(&mut self, until: u64) {
        self.until = until;
        self.buffer = None;
    }

    /// Takes an index error hit while filling the stream.
    pub fn take_error(&mut self) -> Option<crate::error::CoreError> {
        self.error.take()
    }

    /// Returns the next entry without consuming it.
    pub fn peek(&mut self) -> Option<&ChangeEntry> {
        self.fill();
        self.buffer.as_ref().and_then(|b| b.front())
    }

    fn fill(&mut self) {
        if self.buffer.is_some() {
            return;
        }
        match self.cache.snapshot(self.last, self.until) {
            Ok(entries) => self.buffer = Some(entries.into()),
            Err(e) => {
                tracing::warn!(channel = %self.cache.name, error = %e, "change read failed");
                self.error = Some(e);
                self.buffer = Some(VecDeque::new());
            }
        }
    }
}

impl Iterator for ChangesSince {
    type Item = ChangeEntry;

    fn next(&mut self) -> Option<ChangeEntry> {
        self.fill();
        let entry = self.buffer.as_mut().and_then(VecDeque::pop_front)?;
        self.last = entry.sequence;
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_store::MemoryIndex;
    use proptest::prelude::*;

    fn entry(seq: u64, doc: &str) -> ChangeEntry {
        ChangeEntry {
            sequence: seq,
            doc_id: doc.to_string(),
            rev_id: format!("{seq}-r"),
            deleted: false,
            removed: false,
        }
    }

    fn cache(max: usize) -> (Arc<ChannelCache>, Arc<MemoryIndex>) {
        let index = Arc::new(MemoryIndex::new());
        let cache = Arc::new(ChannelCache::new("A", max, 1, index.clone()));
        (cache, index)
    }

    /// Mirrors the write path: index row first, then cache.
    fn record(cache: &ChannelCache, index: &MemoryIndex, e: ChangeEntry) {
        index.insert("A", e.to_row()).unwrap();
        cache.add(e);
    }

    #[test]
    fn late_arrival_is_inserted_in_order() {
        let (cache, _) = cache(10);
        assert!(cache.add(entry(3, "c")));
        assert!(cache.add(entry(1, "a")));
        assert!(cache.add(entry(2, "b")));
        assert!(!cache.add(entry(2, "b")));

        let seqs: Vec<u64> = cache.since(0, u64::MAX).map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn eviction_moves_window() {
        let (cache, index) = cache(3);
        for seq in 1..=5 {
            record(&cache, &index, entry(seq, &format!("d{seq}")));
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.valid_from(), 3);
        assert_eq!(cache.evictions(), 2);
        assert!(cache.cached_since(0, 10).is_none());
        assert!(cache.cached_since(2, 10).is_some());

        assert!(!cache.add(entry(1, "old")));
    }

    #[test]
    fn since_backfills_evicted_prefix() {
        let (cache, index) = cache(2);
        for seq in 1..=6 {
            record(&cache, &index, entry(seq, &format!("d{seq}")));
        }
        let seqs: Vec<u64> = cache.since(1, u64::MAX).map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![2, 3, 4, 5, 6]);
        assert_eq!(cache.backfill_queries(), 1);

        let from_window: Vec<u64> = cache.since(4, u64::MAX).map(|e| e.sequence).collect();
        assert_eq!(from_window, vec![5, 6]);
        assert_eq!(cache.backfill_queries(), 1);
    }

    #[test]
    fn later_entry_supersedes_earlier_for_readers() {
        let (cache, index) = cache(10);
        record(&cache, &index, entry(1, "a"));
        record(&cache, &index, entry(2, "b"));
        record(&cache, &index, entry(3, "a"));

        let all: Vec<(u64, String)> = cache
            .since(0, u64::MAX)
            .map(|e| (e.sequence, e.doc_id))
            .collect();
        assert_eq!(all, vec![(2, "b".to_string()), (3, "a".to_string())]);

        let upto_two: Vec<u64> = cache.since(0, 2).map(|e| e.sequence).collect();
        assert_eq!(upto_two, vec![1, 2]);
    }

    #[test]
    fn since_is_restartable() {
        let (cache, index) = cache(10);
        record(&cache, &index, entry(1, "a"));
        let mut stream = cache.since(0, 1);
        assert_eq!(stream.next().map(|e| e.sequence), Some(1));
        assert_eq!(stream.next(), None);

        record(&cache, &index, entry(2, "b"));
        assert_eq!(stream.next(), None);
        stream.restart(2);
        assert_eq!(stream.next().map(|e| e.sequence), Some(2));
        assert_eq!(stream.cursor(), 2);
    }

    #[test]
    fn remove_doc_erases_entries() {
        let (cache, _) = cache(10);
        cache.add(entry(1, "a"));
        cache.add(entry(2, "b"));
        assert_eq!(cache.remove_doc("a"), 1);
        assert_eq!(cache.len(), 1);
    }

    fn arb_writes() -> impl Strategy<Value = Vec<(u8, bool)>> {
        prop::collection::vec((0u8..6, any::<bool>()), 1..60)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn since_is_strictly_increasing(writes in arb_writes(), max in 1usize..16, from in 0u64..40) {
            let (cache, index) = cache(max);
            for (i, (doc, _)) in writes.iter().enumerate() {
                record(&cache, &index, entry(i as u64 + 1, &format!("d{doc}")));
            }
            let seqs: Vec<u64> = cache.since(from, u64::MAX).map(|e| e.sequence).collect();
            prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(seqs.iter().all(|s| *s > from));
        }

        #[test]
        fn backfill_matches_live_cache(writes in arb_writes(), from in 0u64..30) {
            let (cache, index) = cache(1000);
            for (i, (doc, removed)) in writes.iter().enumerate() {
                let mut e = entry(i as u64 + 1, &format!("d{doc}"));
                e.removed = *removed;
                record(&cache, &index, e);
            }
            let until = writes.len() as u64;
            let live = cache.cached_since(from, until).unwrap();
            let backfill = cache.backfill_from(from, until).unwrap();
            prop_assert_eq!(live, backfill);
        }
    }
}
