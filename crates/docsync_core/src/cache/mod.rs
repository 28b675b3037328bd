//! Channel-indexed, sequence-ordered change caching.
//!
//! Every processed mutation is fanned out to the caches of the channels
//! it is visible in. A [`SequenceTracker`] remembers allocated sequences
//! that have not been seen yet so strictly ordered readers can stop at
//! the stable sequence instead of skipping past a write still in flight.

mod channel;
mod skipped;

pub use channel::{collapse, ChangeEntry, ChangesSince, ChannelCache};
pub use skipped::{Arrival, SequenceTracker};

use crate::config::CacheConfig;
use crate::error::{CoreError, CoreResult};
use docsync_store::SecondaryIndex;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Name of the channel that sees every document.
pub const STAR_CHANNEL: &str = "*";

/// A processed document write, as fed to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocChange {
    /// Sequence of the write.
    pub sequence: u64,
    /// Document ID.
    pub doc_id: String,
    /// Winning revision after the write.
    pub rev_id: String,
    /// Whether the winner is a tombstone.
    pub deleted: bool,
    /// Channels the document is in after the write.
    pub channels: BTreeSet<String>,
    /// Channels the write removed the document from.
    pub removed_channels: BTreeSet<String>,
}

impl DocChange {
    /// Entries this change contributes, paired with their channel.
    pub fn entries(&self, star: bool) -> Vec<(String, ChangeEntry)> {
        let make = |removed| ChangeEntry {
            sequence: self.sequence,
            doc_id: self.doc_id.clone(),
            rev_id: self.rev_id.clone(),
            deleted: self.deleted,
            removed,
        };
        let mut out: Vec<(String, ChangeEntry)> = self
            .channels
            .iter()
            .map(|c| (c.clone(), make(false)))
            .chain(self.removed_channels.iter().map(|c| (c.clone(), make(true))))
            .collect();
        if star {
            out.push((STAR_CHANNEL.to_string(), make(false)));
        }
        out
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently cached across all channels.
    pub entries: usize,
    /// Entries evicted for capacity.
    pub evictions: u64,
    /// Skipped sequences still pending.
    pub skipped_pending: usize,
    /// Skipped sequences aborted after timeout.
    pub aborted: u64,
    /// Aborted sequences that later arrived.
    pub late_arrivals: u64,
    /// Index queries issued for backfill.
    pub backfill_queries: u64,
}

/// The change cache of one collection.
pub struct ChangeCache {
    collection: String,
    config: CacheConfig,
    index: Arc<dyn SecondaryIndex>,
    initial_sequence: u64,
    channels: RwLock<HashMap<String, Arc<ChannelCache>>>,
    tracker: Mutex<SequenceTracker>,
    stable_tx: watch::Sender<u64>,
    /// Bumped on every tracker change, stable or not.
    observed_tx: watch::Sender<u64>,
    quarantined: RwLock<HashSet<String>>,
}

impl ChangeCache {
    /// Creates a cache for a collection whose sequences up to
    /// `last_sequence` are already reflected in the index.
    pub fn new(
        collection: impl Into<String>,
        config: CacheConfig,
        index: Arc<dyn SecondaryIndex>,
        last_sequence: u64,
    ) -> Self {
        let tracker = SequenceTracker::new(
            last_sequence,
            config.skipped_seq_max_wait,
            config.max_aborted_markers,
        );
        let (stable_tx, _) = watch::channel(last_sequence);
        let (observed_tx, _) = watch::channel(0);
        Self {
            collection: collection.into(),
            config,
            index,
            initial_sequence: last_sequence + 1,
            channels: RwLock::new(HashMap::new()),
            tracker: Mutex::new(tracker),
            stable_tx,
            observed_tx,
            quarantined: RwLock::new(HashSet::new()),
        }
    }

    /// Returns the collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns a channel's cache, if one exists.
    pub fn channel(&self, name: &str) -> Option<Arc<ChannelCache>> {
        self.channels.read().get(name).cloned()
    }

    /// Names of all channels with a cache.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn channel_or_create(&self, name: &str) -> Arc<ChannelCache> {
        if let Some(existing) = self.channels.read().get(name) {
            return Arc::clone(existing);
        }
        let mut channels = self.channels.write();
        Arc::clone(channels.entry(name.to_string()).or_insert_with(|| {
            Arc::new(ChannelCache::new(
                name,
                self.config.channel_cache_max_length,
                self.initial_sequence,
                Arc::clone(&self.index),
            ))
        }))
    }

    /// Adds a document change to every channel it affects.
    ///
    /// Returns false if the sequence was already processed.
    pub fn process_change(&self, change: &DocChange) -> bool {
        let mut tracker = self.tracker.lock();
        let arrival = tracker.observe(change.sequence, Instant::now());
        if arrival == Arrival::Duplicate {
            tracing::trace!(seq = change.sequence, doc_id = %change.doc_id, "duplicate change ignored");
            return false;
        }
        if arrival == Arrival::LateAfterAbort {
            tracing::warn!(
                collection = %self.collection,
                seq = change.sequence,
                doc_id = %change.doc_id,
                "late change inserted after abort"
            );
        }

        for (channel, entry) in change.entries(self.config.enable_star_channel) {
            self.channel_or_create(&channel).add(entry);
        }
        self.publish(&tracker);
        true
    }

    /// Records a sequence that was allocated but never used.
    pub fn process_unused(&self, seq: u64) -> bool {
        let mut tracker = self.tracker.lock();
        if tracker.observe(seq, Instant::now()) == Arrival::Duplicate {
            return false;
        }
        tracing::debug!(collection = %self.collection, seq, "unused sequence processed");
        self.publish(&tracker);
        true
    }

    fn publish(&self, tracker: &SequenceTracker) {
        self.observed_tx.send_modify(|n| *n = n.wrapping_add(1));
        let stable = tracker.stable_sequence();
        self.stable_tx.send_if_modified(|current| {
            if *current == stable {
                false
            } else {
                *current = stable;
                true
            }
        });
    }

    /// Highest sequence below every pending skipped sequence.
    pub fn stable_sequence(&self) -> u64 {
        *self.stable_tx.borrow()
    }

    /// Highest sequence processed.
    pub fn high_sequence(&self) -> u64 {
        self.tracker.lock().high_sequence()
    }

    /// Subscribes to stable-sequence updates.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.stable_tx.subscribe()
    }

    /// Entries of `channel` with `from < sequence <= until`.
    pub fn since(&self, channel: &str, from: u64, until: u64) -> ChangesSince {
        self.channel_or_create(channel).since(from, until)
    }

    /// Aborts skipped sequences that have waited too long. Returns how
    /// many were aborted.
    pub fn abort_expired(&self) -> u64 {
        self.abort_expired_at(Instant::now())
    }

    /// Aborts skipped sequences that have waited too long as of `now`.
    pub fn abort_expired_at(&self, now: Instant) -> u64 {
        let mut tracker = self.tracker.lock();
        let aborted = tracker.abort_expired(now);
        if aborted > 0 {
            tracing::warn!(
                collection = %self.collection,
                count = aborted,
                stable = tracker.stable_sequence(),
                "gave up waiting for skipped sequences"
            );
            self.publish(&tracker);
        }
        aborted
    }

    /// Aborted sequences with `from < seq <= until`.
    pub fn aborted_between(&self, from: u64, until: u64) -> Vec<u64> {
        self.tracker.lock().aborted_between(from, until)
    }

    /// Drops a purged document from the given channels.
    pub fn remove_doc(&self, doc_id: &str, channels: &BTreeSet<String>) {
        for name in channels.iter().map(String::as_str).chain([STAR_CHANNEL]) {
            if let Some(cache) = self.channel(name) {
                cache.remove_doc(doc_id);
            }
        }
    }

    /// Excludes a document from change reads until released.
    pub fn quarantine(&self, doc_id: &str) {
        if self.quarantined.write().insert(doc_id.to_string()) {
            tracing::warn!(collection = %self.collection, doc_id, "document quarantined");
        }
    }

    /// Lifts a quarantine.
    pub fn release(&self, doc_id: &str) -> bool {
        self.quarantined.write().remove(doc_id)
    }

    /// Returns true if the document is quarantined.
    pub fn is_quarantined(&self, doc_id: &str) -> bool {
        self.quarantined.read().contains(doc_id)
    }

    /// Returns true if `seq` has been processed or aborted.
    pub fn is_visible(&self, seq: u64) -> bool {
        self.tracker.lock().is_visible(seq)
    }

    /// Waits until `seq` itself is visible, whether or not lower
    /// sequences are still pending.
    ///
    /// Fails with [`CoreError::SequenceTimeout`] after `timeout`, or with
    /// [`CoreError::Cancelled`] as soon as `cancelled` completes.
    pub async fn wait_for_sequence<F>(&self, seq: u64, timeout: Duration, cancelled: F) -> CoreResult<()>
    where
        F: Future<Output = ()>,
    {
        self.wait_until(seq, timeout, cancelled, |t| t.is_visible(seq))
            .await
    }

    /// Waits until `seq` is at or below the stable sequence.
    ///
    /// Fails like [`ChangeCache::wait_for_sequence`]. Expired skipped
    /// sequences are aborted while waiting, so a gap never blocks for
    /// longer than the configured maximum wait.
    pub async fn wait_for_stable<F>(&self, seq: u64, timeout: Duration, cancelled: F) -> CoreResult<()>
    where
        F: Future<Output = ()>,
    {
        self.wait_until(seq, timeout, cancelled, |t| t.stable_sequence() >= seq)
            .await
    }

    async fn wait_until<F, P>(
        &self,
        seq: u64,
        timeout: Duration,
        cancelled: F,
        ready: P,
    ) -> CoreResult<()>
    where
        F: Future<Output = ()>,
        P: Fn(&SequenceTracker) -> bool,
    {
        let mut rx = self.observed_tx.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        tokio::pin!(cancelled);

        loop {
            // Mark seen before checking so no update slips between the two.
            rx.borrow_and_update();
            let done = ready(&*self.tracker.lock());
            if done {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(CoreError::Cancelled);
                    }
                }
                () = &mut cancelled => return Err(CoreError::Cancelled),
                () = &mut deadline => return Err(CoreError::SequenceTimeout { sequence: seq }),
                () = tokio::time::sleep(self.config.sweep_interval) => {
                    self.abort_expired();
                }
            }
        }
    }

    /// Periodically aborts expired skipped sequences until `stop` flips.
    pub async fn run_sweeper(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.abort_expired();
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(collection = %self.collection, "sweeper stopped");
    }

    /// Returns current statistics.
    pub fn stats(&self) -> CacheStats {
        let (skipped_pending, aborted, late_arrivals) = {
            let tracker = self.tracker.lock();
            (
                tracker.pending(),
                tracker.aborted_total(),
                tracker.late_arrivals(),
            )
        };
        let channels = self.channels.read();
        CacheStats {
            entries: channels.values().map(|c| c.len()).sum(),
            evictions: channels.values().map(|c| c.evictions()).sum(),
            skipped_pending,
            aborted,
            late_arrivals,
            backfill_queries: channels.values().map(|c| c.backfill_queries()).sum(),
        }
    }
}

impl std::fmt::Debug for ChangeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeCache")
            .field("collection", &self.collection)
            .field("stable", &self.stable_sequence())
            .finish_non_exhaustive()
    }
}
