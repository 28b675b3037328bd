//! Change feeds over one or more channels.

use crate::cache::{ChangeCache, ChangeEntry, ChangesSince, STAR_CHANNEL};
use crate::error::CoreResult;
use crate::user::UserContext;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Order in which a feed returns entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedOrder {
    /// One globally sequence-ordered stream.
    #[default]
    BySequence,
    /// Each channel's entries in turn, channels in name order.
    ByChannel,
}

/// Options for opening a [`ChangeFeed`].
#[derive(Debug, Clone, Default)]
pub struct FeedOptions {
    /// Only entries with a higher sequence are returned.
    pub since: u64,
    /// Restrict to these channels (intersected with the user's grants).
    pub channels: Option<BTreeSet<String>>,
    /// Restrict to these documents.
    pub doc_ids: Option<BTreeSet<String>>,
    /// Output order.
    pub order: FeedOrder,
    /// Emit [`FeedEvent::Aborted`] for sequences given up on.
    pub include_aborted: bool,
}

impl FeedOptions {
    /// Options starting after `since`.
    pub fn since(since: u64) -> Self {
        Self {
            since,
            ..Self::default()
        }
    }

    /// Restricts the feed to the given channels.
    #[must_use]
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts the feed to the given documents.
    #[must_use]
    pub fn with_doc_ids<I, S>(mut self, doc_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.doc_ids = Some(doc_ids.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the output order.
    #[must_use]
    pub fn with_order(mut self, order: FeedOrder) -> Self {
        self.order = order;
        self
    }

    /// Enables aborted-sequence markers.
    #[must_use]
    pub fn with_aborted(mut self, include: bool) -> Self {
        self.include_aborted = include;
        self
    }
}

/// One item of a change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// A document change.
    Change(ChangeEntry),
    /// A sequence that was allocated but never arrived in time.
    Aborted(u64),
}

impl FeedEvent {
    /// Returns the sequence of the event.
    pub fn sequence(&self) -> u64 {
        match self {
            FeedEvent::Change(entry) => entry.sequence,
            FeedEvent::Aborted(seq) => *seq,
        }
    }

    /// Returns the change entry, if this is one.
    pub fn as_change(&self) -> Option<&ChangeEntry> {
        match self {
            FeedEvent::Change(entry) => Some(entry),
            FeedEvent::Aborted(_) => None,
        }
    }
}

/// Merges the channel streams a user subscribes to.
///
/// The feed only reads up to the cache's stable sequence, so an entry
/// that arrives late can never land behind the feed's cursor.
pub struct ChangeFeed {
    cache: Arc<ChangeCache>,
    user: UserContext,
    options: FeedOptions,
    /// Everything up to here has been read from the cache.
    read_through: u64,
    /// Safe resume point while `pending` is not empty.
    resume_from: u64,
    pending: VecDeque<FeedEvent>,
}

impl ChangeFeed {
    /// Opens a feed for `user`.
    pub fn new(cache: Arc<ChangeCache>, user: UserContext, options: FeedOptions) -> Self {
        let since = options.since;
        Self {
            cache,
            user,
            options,
            read_through: since,
            resume_from: since,
            pending: VecDeque::new(),
        }
    }

    /// Returns the options the feed was opened with.
    pub fn options(&self) -> &FeedOptions {
        &self.options
    }

    /// Sequence a new feed could resume from without losing entries.
    pub fn cursor(&self) -> u64 {
        if self.pending.is_empty() {
            self.read_through
        } else {
            self.resume_from
        }
    }

    /// Returns true if nothing new is readable right now.
    pub fn is_caught_up(&self) -> bool {
        self.pending.is_empty() && self.cache.stable_sequence() <= self.read_through
    }

    /// Channels read by this feed.
    pub fn channels(&self) -> Vec<String> {
        let requested = match &self.options.channels {
            Some(filter) => filter.iter().filter(|c| self.user.can_see(c)).cloned().collect(),
            None if self.user.has_star() => {
                if self.cache.config().enable_star_channel {
                    vec![STAR_CHANNEL.to_string()]
                } else {
                    self.cache.channel_names()
                }
            }
            None => self
                .user
                .channels()
                .iter()
                .filter(|c| c.as_str() != STAR_CHANNEL)
                .cloned()
                .collect(),
        };
        let mut channels: Vec<String> = requested;
        channels.sort();
        channels.dedup();
        channels
    }

    /// Returns up to `limit` events, advancing past each one returned.
    pub fn next_batch(&mut self, limit: usize) -> CoreResult<Vec<FeedEvent>> {
        if self.pending.is_empty() {
            self.refill()?;
        }
        let take = limit.min(self.pending.len());
        let batch: Vec<FeedEvent> = self.pending.drain(..take).collect();
        if self.options.order == FeedOrder::BySequence {
            if let Some(last) = batch.last() {
                self.resume_from = last.sequence();
            }
        }
        Ok(batch)
    }

    fn refill(&mut self) -> CoreResult<()> {
        let from = self.read_through;
        let until = self.cache.stable_sequence();
        if until <= from {
            return Ok(());
        }

        let mut streams: Vec<ChangesSince> = self
            .channels()
            .iter()
            .map(|c| self.cache.since(c, from, until))
            .collect();

        let entries = match self.options.order {
            FeedOrder::BySequence => merge_by_sequence(&mut streams),
            FeedOrder::ByChannel => concat_by_channel(&mut streams),
        };
        for stream in &mut streams {
            if let Some(err) = stream.take_error() {
                return Err(err);
            }
        }

        let cache = &self.cache;
        let doc_filter = self.options.doc_ids.as_ref();
        let mut events: Vec<FeedEvent> = entries
            .into_iter()
            .filter(|e| doc_filter.map_or(true, |ids| ids.contains(&e.doc_id)))
            .filter(|e| !cache.is_quarantined(&e.doc_id))
            .map(FeedEvent::Change)
            .collect();

        if self.options.include_aborted {
            let aborted = self.cache.aborted_between(from, until);
            events.extend(aborted.into_iter().map(FeedEvent::Aborted));
            if self.options.order == FeedOrder::BySequence {
                events.sort_by_key(FeedEvent::sequence);
            }
        }

        tracing::trace!(from, until, events = events.len(), "feed refilled");
        self.pending = events.into();
        self.resume_from = from;
        self.read_through = until;
        Ok(())
    }

    /// Waits until there is something new to read.
    pub async fn wait_for_changes<F>(&self, timeout: Duration, cancelled: F) -> CoreResult<()>
    where
        F: Future<Output = ()>,
    {
        if !self.pending.is_empty() {
            return Ok(());
        }
        self.cache
            .wait_for_stable(self.read_through + 1, timeout, cancelled)
            .await
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("user", &self.user.name())
            .field("read_through", &self.read_through)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// K-way merge ordered by `(sequence, doc_id)`.
///
/// A document seen in several channels at the same sequence is emitted
/// once, preferring a non-removal entry.
fn merge_by_sequence(streams: &mut [ChangesSince]) -> Vec<ChangeEntry> {
    let mut heads: Vec<Option<ChangeEntry>> = streams.iter_mut().map(Iterator::next).collect();
    let mut heap: BinaryHeap<Reverse<(u64, String, usize)>> = heads
        .iter()
        .enumerate()
        .filter_map(|(i, h)| h.as_ref().map(|e| Reverse((e.sequence, e.doc_id.clone(), i))))
        .collect();

    let mut out: Vec<ChangeEntry> = Vec::new();
    while let Some(Reverse((_, _, i))) = heap.pop() {
        let Some(entry) = heads[i].take() else {
            continue;
        };
        if let Some(next) = streams[i].next() {
            heap.push(Reverse((next.sequence, next.doc_id.clone(), i)));
            heads[i] = Some(next);
        }

        match out.last_mut() {
            Some(last) if last.sequence == entry.sequence && last.doc_id == entry.doc_id => {
                if last.removed && !entry.removed {
                    *last = entry;
                }
            }
            _ => out.push(entry),
        }
    }
    out
}

fn concat_by_channel(streams: &mut [ChangesSince]) -> Vec<ChangeEntry> {
    let mut seen: HashSet<(u64, String)> = HashSet::new();
    let mut out = Vec::new();
    for stream in streams.iter_mut() {
        for entry in stream.by_ref() {
            if seen.insert((entry.sequence, entry.doc_id.clone())) {
                out.push(entry);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DocChange;
    use crate::config::CacheConfig;
    use docsync_store::MemoryIndex;
    use tokio::time::Instant;

    fn change(seq: u64, doc: &str, channels: &[&str]) -> DocChange {
        DocChange {
            sequence: seq,
            doc_id: doc.to_string(),
            rev_id: format!("1-{doc}"),
            deleted: false,
            channels: channels.iter().map(|c| c.to_string()).collect(),
            removed_channels: BTreeSet::new(),
        }
    }

    fn cache(last: u64) -> Arc<ChangeCache> {
        Arc::new(ChangeCache::new(
            "_default",
            CacheConfig::default(),
            Arc::new(MemoryIndex::new()),
            last,
        ))
    }

    fn seqs(events: &[FeedEvent]) -> Vec<u64> {
        events.iter().map(FeedEvent::sequence).collect()
    }

    #[test]
    fn merges_channels_in_sequence_order() {
        let cache = cache(0);
        cache.process_change(&change(1, "a", &["A"]));
        cache.process_change(&change(2, "b", &["B"]));
        cache.process_change(&change(3, "c", &["A", "B"]));
        cache.process_change(&change(4, "d", &["C"]));

        let user = UserContext::new("u", ["A", "B"]);
        let mut feed = ChangeFeed::new(cache, user, FeedOptions::since(0));
        let events = feed.next_batch(100).unwrap();
        assert_eq!(seqs(&events), vec![1, 2, 3]);
        assert_eq!(feed.cursor(), 4);
        assert!(feed.is_caught_up());
    }

    #[test]
    fn by_channel_groups_entries() {
        let cache = cache(0);
        cache.process_change(&change(1, "a", &["B"]));
        cache.process_change(&change(2, "b", &["A"]));
        cache.process_change(&change(3, "c", &["A", "B"]));

        let user = UserContext::new("u", ["A", "B"]);
        let mut feed = ChangeFeed::new(
            cache,
            user,
            FeedOptions::since(0).with_order(FeedOrder::ByChannel),
        );
        assert_eq!(seqs(&feed.next_batch(100).unwrap()), vec![2, 3, 1]);
    }

    #[test]
    fn batches_respect_limit_and_cursor() {
        let cache = cache(0);
        for seq in 1..=5 {
            cache.process_change(&change(seq, &format!("d{seq}"), &["A"]));
        }
        let mut feed = ChangeFeed::new(cache, UserContext::new("u", ["A"]), FeedOptions::since(0));
        assert_eq!(seqs(&feed.next_batch(2).unwrap()), vec![1, 2]);
        assert_eq!(feed.cursor(), 2);
        assert_eq!(seqs(&feed.next_batch(2).unwrap()), vec![3, 4]);
        assert_eq!(seqs(&feed.next_batch(2).unwrap()), vec![5]);
        assert!(feed.next_batch(2).unwrap().is_empty());
        assert_eq!(feed.cursor(), 5);
    }

    #[test]
    fn filters_by_doc_ids_and_grants() {
        let cache = cache(0);
        cache.process_change(&change(1, "a", &["A"]));
        cache.process_change(&change(2, "b", &["A"]));
        cache.process_change(&change(3, "c", &["Z"]));

        let mut feed = ChangeFeed::new(
            cache.clone(),
            UserContext::new("u", ["A"]),
            FeedOptions::since(0)
                .with_channels(["A", "Z"])
                .with_doc_ids(["b", "c"]),
        );
        assert_eq!(seqs(&feed.next_batch(10).unwrap()), vec![2]);

        let mut admin = ChangeFeed::new(cache, UserContext::admin("root"), FeedOptions::since(0));
        assert_eq!(seqs(&admin.next_batch(10).unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn removal_and_presence_at_same_sequence_collapse() {
        let cache = cache(0);
        let mut moved = change(1, "a", &["B"]);
        moved.removed_channels.insert("A".into());
        cache.process_change(&moved);

        let mut feed = ChangeFeed::new(cache, UserContext::new("u", ["A", "B"]), FeedOptions::since(0));
        let events = feed.next_batch(10).unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].as_change().unwrap().removed);
    }

    #[test]
    fn stops_at_stable_sequence_and_reports_aborts() {
        let cache = cache(9);
        cache.process_change(&change(11, "b", &["A"]));
        cache.process_change(&change(12, "c", &["A"]));

        let mut feed = ChangeFeed::new(
            cache.clone(),
            UserContext::new("u", ["A"]),
            FeedOptions::since(9).with_aborted(true),
        );
        assert!(feed.next_batch(10).unwrap().is_empty());

        cache.abort_expired_at(Instant::now() + Duration::from_secs(61));
        let events = feed.next_batch(10).unwrap();
        assert_eq!(events[0], FeedEvent::Aborted(10));
        assert_eq!(seqs(&events), vec![10, 11, 12]);
    }

    #[test]
    fn quarantined_documents_are_skipped() {
        let cache = cache(0);
        cache.process_change(&change(1, "bad", &["A"]));
        cache.process_change(&change(2, "good", &["A"]));
        cache.quarantine("bad");
        let mut feed = ChangeFeed::new(cache, UserContext::new("u", ["A"]), FeedOptions::since(0));
        assert_eq!(seqs(&feed.next_batch(10).unwrap()), vec![2]);
    }

    #[tokio::test]
    async fn wait_for_changes_wakes() {
        let cache = cache(0);
        let feed = ChangeFeed::new(cache.clone(), UserContext::new("u", ["A"]), FeedOptions::since(0));
        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cache.process_change(&change(1, "a", &["A"]));
            })
        };
        feed.wait_for_changes(Duration::from_secs(5), std::future::pending())
            .await
            .unwrap();
        writer.await.unwrap();
    }
}
