//! Change delivery: feed → batches → requested revisions.

use super::{Session, SessionStats};
use crate::error::{SessionError, SessionResult};
use crate::flow::BatchTracker;
use crate::state::SessionState;
use bytes::Bytes;
use docsync_core::{
    ChangeEntry, ChangeFeed, CheckpointOwner, Collection, CoreError, FeedEvent, RevId, Revision,
    UnavailableReason,
};
use docsync_protocol::{ChangeRow, ChangesAck, ChangesBatch, RevisionMessage, RevisionUnavailable};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Fixed per-row overhead when estimating batch bytes.
const ROW_OVERHEAD: usize = 24;

#[derive(Debug, Default)]
struct CheckpointCursor {
    rev: Option<String>,
    written: u64,
    last_write: Option<Instant>,
}

/// One subscription's delivery state.
#[derive(Debug)]
pub(crate) struct ChangeStream {
    index: usize,
    collection: Arc<Collection>,
    client: Option<String>,
    tracker: Mutex<BatchTracker>,
    checkpoint: Mutex<CheckpointCursor>,
}

impl ChangeStream {
    pub(crate) fn new(
        index: usize,
        collection: Arc<Collection>,
        client: Option<String>,
        since: u64,
        checkpoint_rev: Option<String>,
    ) -> Self {
        Self {
            index,
            collection,
            client,
            tracker: Mutex::new(BatchTracker::new(since)),
            checkpoint: Mutex::new(CheckpointCursor {
                rev: checkpoint_rev,
                written: since,
                last_write: None,
            }),
        }
    }

    fn progress(&self, session: &Session) {
        let advanced = self.tracker.lock().advance();
        if let Some(seq) = advanced {
            session
                .stats
                .acknowledged_sequence
                .fetch_max(seq, Ordering::Relaxed);
            self.write_checkpoint(session, false);
        }
    }

    /// Writes the acknowledged position now, ignoring the interval.
    pub(crate) fn flush_checkpoint(&self, session: &Session) {
        let advanced = self.tracker.lock().advance();
        if let Some(seq) = advanced {
            session
                .stats
                .acknowledged_sequence
                .fetch_max(seq, Ordering::Relaxed);
        }
        self.write_checkpoint(session, true);
    }

    fn write_checkpoint(&self, session: &Session, force: bool) {
        let Some(client) = &self.client else {
            return;
        };
        let acknowledged = self.tracker.lock().acknowledged();
        let mut cursor = self.checkpoint.lock();
        if acknowledged <= cursor.written {
            return;
        }
        if !force
            && cursor
                .last_write
                .is_some_and(|t| t.elapsed() < session.config.checkpoint_interval)
        {
            return;
        }

        let store = self.collection.checkpoints();
        let user = session.user.name();
        let mut result = store.set(
            CheckpointOwner::Server,
            user,
            client,
            cursor.rev.as_deref(),
            acknowledged,
            Vec::new(),
        );
        if let Err(CoreError::CheckpointMismatch { .. }) = result {
            // Another session for the same client wrote in between.
            result = store
                .get(CheckpointOwner::Server, user, client)
                .and_then(|existing| {
                    let rev = existing.map(|c| c.rev);
                    store.set(
                        CheckpointOwner::Server,
                        user,
                        client,
                        rev.as_deref(),
                        acknowledged,
                        Vec::new(),
                    )
                });
        }
        match result {
            Ok(rev) => {
                debug!(client = %client, sequence = acknowledged, rev = %rev, "checkpoint advanced");
                cursor.rev = Some(rev);
                cursor.written = acknowledged;
                cursor.last_write = Some(Instant::now());
            }
            Err(e) => warn!(client = %client, error = %e, "failed to store checkpoint"),
        }
    }
}

fn change_row(entry: &ChangeEntry) -> ChangeRow {
    ChangeRow {
        sequence: entry.sequence,
        doc_id: entry.doc_id.clone(),
        rev: entry.rev_id.clone(),
        deleted: entry.deleted,
        removed: entry.removed,
    }
}

/// Splits rows into batches of at most `max_bytes` estimated size. A
/// single oversized row still forms its own batch.
fn split_rows(rows: Vec<ChangeRow>, max_bytes: usize) -> Vec<Vec<ChangeRow>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut size = 0;
    for row in rows {
        let cost = row.doc_id.len() + row.rev.len() + ROW_OVERHEAD;
        if !current.is_empty() && size + cost > max_bytes {
            batches.push(std::mem::take(&mut current));
            size = 0;
        }
        size += cost;
        current.push(row);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

impl Session {
    /// Starts delivering `feed` on its own task.
    pub(super) fn start_stream(
        self: &Arc<Self>,
        stream: Arc<ChangeStream>,
        feed: ChangeFeed,
        batch_size: usize,
        continuous: bool,
    ) {
        *self.stream.lock() = Some(Arc::clone(&stream));
        let session = Arc::clone(self);
        let task = tokio::spawn(
            async move {
                let result = Arc::clone(&session)
                    .deliver(stream, feed, batch_size, continuous)
                    .await;
                match result {
                    Ok(()) => {}
                    Err(SessionError::Cancelled | SessionError::Disconnected) => {
                        debug!("change delivery stopped");
                    }
                    Err(e) => {
                        warn!(error = %e, "change delivery failed");
                        session.close();
                    }
                }
            }
            .in_current_span(),
        );
        *self.stream_task.lock() = Some(task);
    }

    async fn deliver(
        self: Arc<Self>,
        stream: Arc<ChangeStream>,
        mut feed: ChangeFeed,
        batch_size: usize,
        continuous: bool,
    ) -> SessionResult<()> {
        let mut closed = self.closed.subscribe();
        let mut caught_up = false;
        loop {
            if self.is_closed() {
                return Err(SessionError::Cancelled);
            }
            let rows: Vec<ChangeRow> = feed
                .next_batch(batch_size)?
                .iter()
                .filter_map(FeedEvent::as_change)
                .map(change_row)
                .collect();

            if rows.is_empty() {
                if !caught_up {
                    self.flow.drained().await?;
                    self.send_batch(&stream, Vec::new()).await?;
                    caught_up = true;
                    stream.flush_checkpoint(&self);
                    if !continuous {
                        self.transition(SessionState::Draining)?;
                        info!(sequence = feed.cursor(), "caught up");
                        return Ok(());
                    }
                    info!(sequence = feed.cursor(), "caught up; waiting for changes");
                }
                let cancelled = async {
                    let _ = closed.changed().await;
                };
                match feed.wait_for_changes(self.config.heartbeat, cancelled).await {
                    Ok(()) | Err(CoreError::SequenceTimeout { .. }) => {}
                    Err(CoreError::Cancelled) => return Err(SessionError::Cancelled),
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            for chunk in split_rows(rows, self.config.batch_max_bytes) {
                self.send_batch(&stream, chunk).await?;
            }
        }
    }

    /// Sends one batch, waits for the peer's ack, then sends every
    /// revision the peer asked for.
    async fn send_batch(
        self: &Arc<Self>,
        stream: &Arc<ChangeStream>,
        rows: Vec<ChangeRow>,
    ) -> SessionResult<()> {
        let batch = ChangesBatch { rows };
        let id = batch.last_sequence().map(|last| stream.tracker.lock().open(last));
        let msg = batch
            .to_message()?
            .with_collection(self.collection_qualifier(stream.index));

        let ack = match self.request(msg).await {
            Ok(reply) => ChangesAck::from_response(&reply).map_err(SessionError::from),
            Err(e) => Err(e),
        };
        let ack = match ack {
            Ok(ack) => ack,
            Err(e) => {
                if let Some(id) = id {
                    stream.tracker.lock().fail(id);
                }
                return Err(e);
            }
        };
        SessionStats::bump(&self.stats.batches_sent);
        let Some(id) = id else {
            return Ok(());
        };

        let wanted: Vec<(&ChangeRow, &String)> = batch
            .rows
            .iter()
            .enumerate()
            .flat_map(|(i, row)| ack.wanted_at(i).iter().map(move |rev| (row, rev)))
            .collect();
        debug!(rows = batch.rows.len(), wanted = wanted.len(), "batch acknowledged");
        stream.tracker.lock().acked(id, wanted.len());
        stream.progress(self);

        for (row, rev) in wanted {
            self.send_revision(stream, id, row, rev).await?;
        }
        Ok(())
    }

    fn load_revision(
        &self,
        stream: &ChangeStream,
        doc_id: &str,
        rev: &str,
    ) -> SessionResult<Result<Revision, UnavailableReason>> {
        let Ok(rev_id) = rev.parse::<RevId>() else {
            return Ok(Err(UnavailableReason::Missing));
        };
        match stream.collection.get_rev_for(
            &self.user,
            doc_id,
            &rev_id,
            self.config.history_limit + 1,
        ) {
            Ok(revision) => Ok(Ok(revision)),
            Err(CoreError::RevisionUnavailable { reason, .. }) => Ok(Err(reason)),
            Err(e) => Err(e.into()),
        }
    }

    async fn send_revision(
        self: &Arc<Self>,
        stream: &Arc<ChangeStream>,
        batch: u64,
        row: &ChangeRow,
        rev: &str,
    ) -> SessionResult<()> {
        let qualifier = self.collection_qualifier(stream.index);
        let revision = match self.load_revision(stream, &row.doc_id, rev)? {
            Ok(revision) => revision,
            Err(reason) => {
                let norev = RevisionUnavailable {
                    doc_id: row.doc_id.clone(),
                    rev: rev.to_string(),
                    reason: reason.as_str().to_string(),
                    status: reason.status_code(),
                };
                self.notify(norev.to_message().with_collection(qualifier))
                    .await?;
                SessionStats::bump(&self.stats.norevs_sent);
                debug!(doc_id = %row.doc_id, rev, reason = reason.as_str(), "revision unavailable");
                stream.tracker.lock().revision_done(batch, true);
                stream.progress(self);
                return Ok(());
            }
        };

        let body = Bytes::from(revision.body.to_json()?);
        let permit = self.flow.acquire(body.len()).await?;
        {
            let mut advertised = self.advertised.lock();
            for meta in revision.body.attachments.values() {
                advertised.insert((stream.index, meta.digest.clone()));
            }
        }

        let msg = RevisionMessage {
            doc_id: row.doc_id.clone(),
            rev: revision.rev.to_string(),
            history: revision
                .history
                .iter()
                .skip(1)
                .take(self.config.history_limit)
                .map(ToString::to_string)
                .collect(),
            deleted: revision.deleted,
            sequence: Some(row.sequence),
            body,
        }
        .to_message()?
        .compressed(self.config.compress_revs)
        .with_collection(qualifier);

        let session = Arc::clone(self);
        let stream = Arc::clone(stream);
        let doc_id = row.doc_id.clone();
        tokio::spawn(
            async move {
                let result = session.request(msg).await;
                let ok = match result {
                    Ok(_) => {
                        SessionStats::bump(&session.stats.revisions_sent);
                        true
                    }
                    Err(e) => {
                        warn!(doc_id = %doc_id, error = %e, "revision not acknowledged");
                        false
                    }
                };
                stream.tracker.lock().revision_done(batch, ok);
                stream.progress(&session);
                // Released last so a drained window implies recorded progress.
                drop(permit);
            }
            .in_current_span(),
        );
        Ok(())
    }
}
