//! Tracking of allocated-but-unseen sequences.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;

/// How an observed sequence relates to what was already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// The next expected sequence, or one beyond it (gaps become skipped).
    InOrder,
    /// A previously skipped sequence.
    FilledGap,
    /// A sequence that had already been given up on.
    LateAfterAbort,
    /// Already processed.
    Duplicate,
}

/// A run of consecutive skipped sequences, keyed by its first sequence.
#[derive(Debug, Clone, Copy)]
struct SkippedRun {
    last: u64,
    since: Instant,
}

/// Every sequence below `next_expected` is in exactly one of: seen,
/// `skipped` (still pending), or `aborted`.
///
/// Skipped sequences are kept as runs, so a far-ahead arrival costs one
/// entry regardless of the gap it opens.
#[derive(Debug)]
pub struct SequenceTracker {
    next_expected: u64,
    skipped: BTreeMap<u64, SkippedRun>,
    aborted: BTreeSet<u64>,
    max_aborted: usize,
    max_wait: Duration,
    aborted_total: u64,
    late_arrivals: u64,
}

impl SequenceTracker {
    /// Creates a tracker that has seen everything up to `last_sequence`.
    pub fn new(last_sequence: u64, max_wait: Duration, max_aborted: usize) -> Self {
        Self {
            next_expected: last_sequence + 1,
            skipped: BTreeMap::new(),
            aborted: BTreeSet::new(),
            max_aborted: max_aborted.max(1),
            max_wait,
            aborted_total: 0,
            late_arrivals: 0,
        }
    }

    /// Records that `seq` has been processed.
    pub fn observe(&mut self, seq: u64, now: Instant) -> Arrival {
        if seq >= self.next_expected {
            if seq > self.next_expected {
                tracing::debug!(
                    from = self.next_expected,
                    to = seq - 1,
                    "sequences skipped"
                );
                self.skipped.insert(
                    self.next_expected,
                    SkippedRun {
                        last: seq - 1,
                        since: now,
                    },
                );
            }
            self.next_expected = seq + 1;
            return Arrival::InOrder;
        }
        if self.take_skipped(seq) {
            return Arrival::FilledGap;
        }
        if self.aborted.remove(&seq) {
            self.late_arrivals += 1;
            tracing::warn!(seq, "sequence arrived after being aborted");
            return Arrival::LateAfterAbort;
        }
        Arrival::Duplicate
    }

    fn run_containing(&self, seq: u64) -> Option<(u64, SkippedRun)> {
        self.skipped
            .range(..=seq)
            .next_back()
            .filter(|(_, run)| seq <= run.last)
            .map(|(first, run)| (*first, *run))
    }

    /// Removes `seq` from its skipped run, splitting the run around it.
    fn take_skipped(&mut self, seq: u64) -> bool {
        let Some((first, run)) = self.run_containing(seq) else {
            return false;
        };
        self.skipped.remove(&first);
        if first < seq {
            self.skipped.insert(
                first,
                SkippedRun {
                    last: seq - 1,
                    since: run.since,
                },
            );
        }
        if seq < run.last {
            self.skipped.insert(seq + 1, run);
        }
        true
    }

    /// Highest sequence with no pending sequence at or below it.
    pub fn stable_sequence(&self) -> u64 {
        match self.skipped.keys().next() {
            Some(&first) => first - 1,
            None => self.next_expected - 1,
        }
    }

    /// Highest sequence observed.
    pub fn high_sequence(&self) -> u64 {
        self.next_expected - 1
    }

    /// Returns true if `seq` has been observed or given up on.
    pub fn is_visible(&self, seq: u64) -> bool {
        seq <= self.high_sequence() && !self.is_pending(seq)
    }

    /// Gives up on skipped sequences pending for at least the max wait.
    ///
    /// Returns how many sequences were newly aborted. Only the newest
    /// `max_aborted` markers are retained.
    pub fn abort_expired(&mut self, now: Instant) -> u64 {
        let expired: Vec<(u64, u64)> = self
            .skipped
            .iter()
            .filter(|(_, run)| now.saturating_duration_since(run.since) >= self.max_wait)
            .map(|(first, run)| (*first, run.last))
            .collect();

        let mut count = 0;
        for (first, last) in expired {
            self.skipped.remove(&first);
            tracing::warn!(from = first, to = last, "skipped sequences aborted after timeout");
            count += last - first + 1;
            let keep_from = last
                .saturating_sub(self.max_aborted as u64 - 1)
                .max(first);
            self.aborted.extend(keep_from..=last);
        }
        self.aborted_total += count;

        while self.aborted.len() > self.max_aborted {
            self.aborted.pop_first();
        }
        count
    }

    /// Aborted sequences with `from < seq <= until`.
    pub fn aborted_between(&self, from: u64, until: u64) -> Vec<u64> {
        if until <= from {
            return Vec::new();
        }
        self.aborted.range(from + 1..=until).copied().collect()
    }

    /// Returns true if `seq` is still pending.
    pub fn is_pending(&self, seq: u64) -> bool {
        self.run_containing(seq).is_some()
    }

    /// Number of pending skipped sequences.
    pub fn pending(&self) -> usize {
        let total: u64 = self
            .skipped
            .iter()
            .map(|(first, run)| run.last - first + 1)
            .sum();
        usize::try_from(total).unwrap_or(usize::MAX)
    }

    /// Total sequences aborted so far.
    pub fn aborted_total(&self) -> u64 {
        self.aborted_total
    }

    /// Total late arrivals after abort.
    pub fn late_arrivals(&self) -> u64 {
        self.late_arrivals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> SequenceTracker {
        SequenceTracker::new(9, Duration::from_secs(60), 4)
    }

    #[test]
    fn in_order_advances_stable() {
        let mut t = tracker();
        let now = Instant::now();
        assert_eq!(t.stable_sequence(), 9);
        assert_eq!(t.observe(10, now), Arrival::InOrder);
        assert_eq!(t.observe(11, now), Arrival::InOrder);
        assert_eq!(t.stable_sequence(), 11);
        assert_eq!(t.observe(11, now), Arrival::Duplicate);
    }

    #[test]
    fn gap_holds_stable_until_filled() {
        let mut t = tracker();
        let now = Instant::now();
        t.observe(11, now);
        t.observe(12, now);
        assert!(t.is_pending(10));
        assert_eq!(t.stable_sequence(), 9);
        assert_eq!(t.high_sequence(), 12);

        assert_eq!(t.observe(10, now), Arrival::FilledGap);
        assert_eq!(t.stable_sequence(), 12);
        assert_eq!(t.pending(), 0);
    }

    #[test]
    fn expired_skip_is_aborted_then_late_arrival_counted() {
        let mut t = tracker();
        let now = Instant::now();
        t.observe(11, now);
        assert_eq!(t.abort_expired(now + Duration::from_secs(30)), 0);

        assert_eq!(t.abort_expired(now + Duration::from_secs(61)), 1);
        assert_eq!(t.stable_sequence(), 11);
        assert_eq!(t.aborted_between(9, 11), vec![10]);
        assert_eq!(t.aborted_between(10, 11), Vec::<u64>::new());

        assert_eq!(t.observe(10, now), Arrival::LateAfterAbort);
        assert_eq!(t.late_arrivals(), 1);
        assert!(t.aborted_between(0, 20).is_empty());
        assert_eq!(t.observe(10, now), Arrival::Duplicate);
    }

    #[test]
    fn aborted_set_is_bounded() {
        let mut t = tracker();
        let now = Instant::now();
        t.observe(20, now);
        assert_eq!(t.abort_expired(now + Duration::from_secs(120)), 10);
        assert_eq!(t.aborted_total(), 10);
        assert_eq!(t.aborted_between(0, 100), vec![16, 17, 18, 19]);
    }

    #[test]
    fn filling_inside_a_run_splits_it() {
        let mut t = tracker();
        let now = Instant::now();
        t.observe(20, now);
        assert_eq!(t.pending(), 10);

        assert_eq!(t.observe(14, now), Arrival::FilledGap);
        assert!(t.is_pending(13));
        assert!(!t.is_pending(14));
        assert!(t.is_pending(15));
        assert_eq!(t.pending(), 9);
        assert!(t.is_visible(14));
        assert!(!t.is_visible(15));

        assert_eq!(t.observe(10, now), Arrival::FilledGap);
        assert_eq!(t.stable_sequence(), 10);
        assert_eq!(t.observe(14, now), Arrival::Duplicate);
    }

    #[test]
    fn far_ahead_arrival_is_one_run() {
        let mut t = tracker();
        let now = Instant::now();
        t.observe(1_000_000_000, now);
        assert_eq!(t.skipped.len(), 1);
        assert_eq!(t.pending(), 1_000_000_000 - 10);
        assert!(t.is_pending(500_000_000));
        assert_eq!(t.stable_sequence(), 9);

        let aborted = t.abort_expired(now + Duration::from_secs(61));
        assert_eq!(aborted, 1_000_000_000 - 10);
        assert_eq!(t.aborted.len(), 4);
        assert_eq!(
            t.aborted_between(0, u64::MAX - 1),
            vec![999_999_996, 999_999_997, 999_999_998, 999_999_999]
        );
        assert_eq!(t.stable_sequence(), 1_000_000_000);
    }
}
