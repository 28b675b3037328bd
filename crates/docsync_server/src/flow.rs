//! Flow control and batch acknowledgement tracking.

use crate::error::{SessionError, SessionResult};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds the revision sends awaiting the peer's reply, by count and by
/// body bytes. Acquiring blocks the sender until earlier sends are
/// answered.
#[derive(Debug)]
pub struct FlowControl {
    revs: Arc<Semaphore>,
    bytes: Arc<Semaphore>,
    max_revs: u32,
    max_bytes: u32,
}

/// Capacity held by one in-flight revision; released on drop.
#[derive(Debug)]
pub struct FlowPermit {
    _revs: OwnedSemaphorePermit,
    _bytes: OwnedSemaphorePermit,
}

impl FlowControl {
    /// Creates a window of `max_revs` sends and `max_bytes` body bytes.
    pub fn new(max_revs: usize, max_bytes: usize) -> Self {
        let max_revs = u32::try_from(max_revs.max(1)).unwrap_or(u32::MAX);
        let max_bytes = u32::try_from(max_bytes.max(1)).unwrap_or(u32::MAX);
        Self {
            revs: Arc::new(Semaphore::new(max_revs as usize)),
            bytes: Arc::new(Semaphore::new(max_bytes as usize)),
            max_revs,
            max_bytes,
        }
    }

    fn byte_cost(&self, size: usize) -> u32 {
        // A body larger than the whole window still goes out, alone.
        u32::try_from(size).unwrap_or(u32::MAX).clamp(1, self.max_bytes)
    }

    /// Waits for room for a send of `size` body bytes.
    pub async fn acquire(&self, size: usize) -> SessionResult<FlowPermit> {
        let revs = Arc::clone(&self.revs)
            .acquire_owned()
            .await
            .map_err(|_| SessionError::Cancelled)?;
        let bytes = Arc::clone(&self.bytes)
            .acquire_many_owned(self.byte_cost(size))
            .await
            .map_err(|_| SessionError::Cancelled)?;
        Ok(FlowPermit {
            _revs: revs,
            _bytes: bytes,
        })
    }

    /// Takes room without waiting, if available.
    pub fn try_acquire(&self, size: usize) -> Option<FlowPermit> {
        let revs = Arc::clone(&self.revs).try_acquire_owned().ok()?;
        let bytes = Arc::clone(&self.bytes)
            .try_acquire_many_owned(self.byte_cost(size))
            .ok()?;
        Some(FlowPermit {
            _revs: revs,
            _bytes: bytes,
        })
    }

    /// Number of sends currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_revs as usize - self.revs.available_permits()
    }

    /// Waits until every permit has been returned.
    pub async fn drained(&self) -> SessionResult<()> {
        let all = self
            .revs
            .acquire_many(self.max_revs)
            .await
            .map_err(|_| SessionError::Cancelled)?;
        drop(all);
        Ok(())
    }

    /// Fails current and future waiters with [`SessionError::Cancelled`].
    pub fn close(&self) {
        self.revs.close();
        self.bytes.close();
    }
}

#[derive(Debug)]
struct BatchState {
    id: u64,
    last_sequence: u64,
    outstanding: usize,
    acked: bool,
    failed: bool,
}

/// Tracks sent batches until the peer has acknowledged them and received
/// every revision it asked for.
///
/// Only a contiguous prefix of complete batches advances the
/// acknowledged sequence. A failed batch stops advancement for good, so
/// a resumed session re-delivers from before it.
#[derive(Debug)]
pub struct BatchTracker {
    next_id: u64,
    batches: VecDeque<BatchState>,
    acknowledged: u64,
    stalled: bool,
}

impl BatchTracker {
    /// Starts tracking after `since`.
    pub fn new(since: u64) -> Self {
        Self {
            next_id: 0,
            batches: VecDeque::new(),
            acknowledged: since,
            stalled: false,
        }
    }

    /// Records a batch about to be sent.
    pub fn open(&mut self, last_sequence: u64) -> u64 {
        self.next_id += 1;
        self.batches.push_back(BatchState {
            id: self.next_id,
            last_sequence,
            outstanding: 0,
            acked: false,
            failed: false,
        });
        self.next_id
    }

    fn get_mut(&mut self, id: u64) -> Option<&mut BatchState> {
        self.batches.iter_mut().find(|b| b.id == id)
    }

    /// Records the peer's ack and how many revisions it asked for.
    pub fn acked(&mut self, id: u64, wanted: usize) {
        if let Some(batch) = self.get_mut(id) {
            batch.acked = true;
            batch.outstanding += wanted;
        }
    }

    /// Records one requested revision as answered (`ok`) or failed.
    pub fn revision_done(&mut self, id: u64, ok: bool) {
        if let Some(batch) = self.get_mut(id) {
            batch.outstanding = batch.outstanding.saturating_sub(1);
            batch.failed |= !ok;
        }
    }

    /// Marks a batch as failed, e.g. when its ack never arrived.
    pub fn fail(&mut self, id: u64) {
        if let Some(batch) = self.get_mut(id) {
            batch.failed = true;
        }
    }

    /// Pops complete batches from the front. Returns the new acknowledged
    /// sequence if it moved.
    pub fn advance(&mut self) -> Option<u64> {
        let before = self.acknowledged;
        while !self.stalled {
            match self.batches.front() {
                Some(b) if b.failed => self.stalled = true,
                Some(b) if b.acked && b.outstanding == 0 => {
                    self.acknowledged = self.acknowledged.max(b.last_sequence);
                    self.batches.pop_front();
                }
                _ => break,
            }
        }
        (self.acknowledged > before).then_some(self.acknowledged)
    }

    /// Highest sequence covered by fully acknowledged batches.
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    /// Batches not yet complete.
    pub fn in_flight(&self) -> usize {
        self.batches.len()
    }

    /// Returns true once a failed batch has stopped advancement.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }
}
