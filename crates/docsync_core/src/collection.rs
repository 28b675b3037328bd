//! Per-collection document write and read paths.

use crate::cache::{ChangeCache, DocChange};
use crate::checkpoint::CheckpointStore;
use crate::config::DatabaseConfig;
use crate::document::{attachment_digest, DocBody, DocumentRecord};
use crate::error::{CoreError, CoreResult, UnavailableReason};
use crate::feed::{ChangeFeed, FeedOptions};
use crate::revision::{RevId, RevInfo};
use crate::sequence::{unused_prefix, SequenceAllocator};
use crate::user::{ChannelMapper, UserContext};
use docsync_store::{Cas, KvStore, Mutation, SecondaryIndex, StoreError};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Outcome of a document write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    /// The revision written (or already present).
    pub rev: RevId,
    /// Sequence assigned, or 0 if the revision was already known.
    pub sequence: u64,
    /// Whether anything was written.
    pub inserted: bool,
}

/// A revision as served to a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID.
    pub rev: RevId,
    /// Body with `_id` and `_rev` filled in.
    pub body: DocBody,
    /// Ancestry, newest first, starting with `rev`.
    pub history: Vec<RevId>,
    /// Whether the revision is a tombstone.
    pub deleted: bool,
    /// Sequence of the document's latest write.
    pub sequence: u64,
    /// Channels the revision is in.
    pub channels: BTreeSet<String>,
}

/// What a write does to a loaded record.
enum Edit {
    /// Nothing to write; the revision is already present.
    Unchanged(RevId),
    /// The record was changed; write it.
    Changed(RevId),
}

/// One collection: its document keyspace, sequence allocator and cache.
pub struct Collection {
    name: String,
    config: Arc<DatabaseConfig>,
    store: Arc<dyn KvStore>,
    index: Arc<dyn SecondaryIndex>,
    mapper: Arc<dyn ChannelMapper>,
    allocator: SequenceAllocator,
    cache: Arc<ChangeCache>,
    checkpoints: CheckpointStore,
    doc_prefix: String,
}

impl Collection {
    pub(crate) fn open(
        name: &str,
        config: Arc<DatabaseConfig>,
        store: Arc<dyn KvStore>,
        index: Arc<dyn SecondaryIndex>,
        mapper: Arc<dyn ChannelMapper>,
    ) -> CoreResult<Self> {
        let allocator = SequenceAllocator::new(Arc::clone(&store), name);
        let last = allocator.last()?;
        let cache = Arc::new(ChangeCache::new(
            name,
            config.cache.clone(),
            Arc::clone(&index),
            last,
        ));
        debug!(collection = name, last_sequence = last, "collection opened");
        Ok(Self {
            name: name.to_string(),
            checkpoints: CheckpointStore::new(Arc::clone(&store), name),
            doc_prefix: format!("_sync:doc:{name}:"),
            config,
            store,
            index,
            mapper,
            allocator,
            cache,
        })
    }

    /// Returns the collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the change cache.
    pub fn cache(&self) -> &Arc<ChangeCache> {
        &self.cache
    }

    /// Returns the checkpoint store.
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Returns the sequence allocator.
    pub fn allocator(&self) -> &SequenceAllocator {
        &self.allocator
    }

    /// Last allocated sequence.
    pub fn last_sequence(&self) -> CoreResult<u64> {
        self.allocator.last()
    }

    /// Opens a change feed for `user`.
    pub fn changes(&self, user: UserContext, options: FeedOptions) -> ChangeFeed {
        ChangeFeed::new(Arc::clone(&self.cache), user, options)
    }

    fn doc_key(&self, doc_id: &str) -> String {
        format!("{}{doc_id}", self.doc_prefix)
    }

    fn purged_key(&self, doc_id: &str) -> String {
        format!("_sync:purged:{}:{doc_id}", self.name)
    }

    fn attachment_key(&self, digest: &str) -> String {
        format!("_sync:att:{}:{digest}", self.name)
    }

    /// Loads and checks a document record.
    ///
    /// A record that fails to decode or validate quarantines the document.
    pub fn document(&self, doc_id: &str) -> CoreResult<Option<DocumentRecord>> {
        Ok(self.load(doc_id)?.map(|(record, _)| record))
    }

    fn load(&self, doc_id: &str) -> CoreResult<Option<(DocumentRecord, Cas)>> {
        let Some(found) = self.store.get(&self.doc_key(doc_id))? else {
            return Ok(None);
        };
        match DocumentRecord::decode(doc_id, &found.value) {
            Ok(record) => Ok(Some((record, found.cas))),
            Err(e) => {
                error!(collection = %self.name, doc_id, error = %e, "corrupt document record");
                self.cache.quarantine(doc_id);
                Err(e)
            }
        }
    }

    fn resolve_channels(
        &self,
        record: &DocumentRecord,
        doc_id: &str,
        body: &DocBody,
        explicit: Option<BTreeSet<String>>,
    ) -> BTreeSet<String> {
        let channels = explicit.unwrap_or_else(|| self.mapper.channels_for(doc_id, body));
        if body.deleted && channels.is_empty() {
            record.channels.clone()
        } else {
            channels
        }
    }

    /// Writes a new revision (`new_edits=true`).
    ///
    /// `parent` must be the current winner unless conflicts are allowed.
    /// A document whose winner is a tombstone may be recreated without a
    /// parent. `channels` overrides the channel mapper.
    pub fn put(
        &self,
        doc_id: &str,
        parent: Option<&RevId>,
        mut body: DocBody,
        channels: Option<BTreeSet<String>>,
    ) -> CoreResult<PutResult> {
        body.id = None;
        body.rev = None;
        let allow_conflicts = self.config.allow_conflicts;

        self.write(doc_id, |record| {
            let winner = record.tree.winning_revision().map(|w| w.id.clone());
            let parent = match (parent, &winner) {
                (None, Some(w)) if record.deleted => Some(w.clone()),
                (p, _) => p.cloned(),
            };
            if !allow_conflicts && winner.is_some() && record.tree.is_conflict(parent.as_ref()) {
                return Err(CoreError::RevisionConflict {
                    doc_id: doc_id.to_string(),
                });
            }

            let canonical = body.canonical_json()?;
            let new_rev = RevId::compute(parent.as_ref(), body.deleted, canonical.as_bytes());
            if record.tree.contains(&new_rev) {
                return Ok(Edit::Unchanged(new_rev));
            }

            let mut stored = body.clone();
            for meta in stored.attachments.values_mut() {
                if meta.revpos == 0 {
                    meta.revpos = new_rev.generation();
                }
                meta.stub = true;
            }
            let channels = self.resolve_channels(record, doc_id, &stored, channels.clone());
            record
                .tree
                .add_revision(parent.as_ref(), new_rev.clone(), stored.deleted, channels)?;
            record.tree.set_body(&new_rev, stored.canonical_json()?)?;
            Ok(Edit::Changed(new_rev))
        })
    }

    /// Deletes a document by writing a tombstone under `parent`.
    pub fn delete(&self, doc_id: &str, parent: &RevId) -> CoreResult<PutResult> {
        let body = DocBody {
            deleted: true,
            ..DocBody::default()
        };
        self.put(doc_id, Some(parent), body, None)
    }

    /// Inserts a revision with its history (`new_edits=false`).
    ///
    /// `history` is newest first and may be disconnected from the local
    /// tree; conflicts are accepted.
    pub fn put_existing(
        &self,
        doc_id: &str,
        history: &[RevId],
        mut body: DocBody,
        deleted: bool,
        channels: Option<BTreeSet<String>>,
    ) -> CoreResult<PutResult> {
        let Some(newest) = history.first().cloned() else {
            return Err(CoreError::InvalidHistory("empty revision history".into()));
        };
        body.id = None;
        body.rev = None;
        body.deleted = deleted;

        self.write(doc_id, |record| {
            if record.tree.contains(&newest) {
                return Ok(Edit::Unchanged(newest.clone()));
            }
            let channels = self.resolve_channels(record, doc_id, &body, channels.clone());
            record.tree.add_history(history, deleted, channels)?;
            record.tree.set_body(&newest, body.canonical_json()?)?;
            Ok(Edit::Changed(newest.clone()))
        })
    }

    /// The optimistic write loop shared by every mutation.
    fn write<F>(&self, doc_id: &str, mut edit: F) -> CoreResult<PutResult>
    where
        F: FnMut(&mut DocumentRecord) -> CoreResult<Edit>,
    {
        let retry = &self.config.cas_retry;
        let key = self.doc_key(doc_id);

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                std::thread::sleep(retry.delay_for_attempt(attempt));
            }

            let (mut record, cas) = match self.load(doc_id)? {
                Some(loaded) => loaded,
                None => (DocumentRecord::new(doc_id), 0),
            };

            let rev = match edit(&mut record)? {
                Edit::Unchanged(rev) => {
                    return Ok(PutResult {
                        rev,
                        sequence: 0,
                        inserted: false,
                    })
                }
                Edit::Changed(rev) => rev,
            };

            record.tree.prune(
                self.config.revs_limit,
                self.config.tombstone_max_age,
                crate::now_millis(),
            );
            record.refresh_winner();
            let seq = self.allocator.next()?;
            record.sequence = seq;
            let bytes = record.encode()?;

            match self.store.compare_and_swap(&key, cas, bytes) {
                Ok(_) => {
                    if cas == 0 {
                        if let Err(e) = self.store.delete(&self.purged_key(doc_id)) {
                            warn!(doc_id, error = %e, "failed to clear purge marker");
                        }
                    }
                    self.ingest(&record);
                    debug!(collection = %self.name, doc_id, rev = %rev, seq, "document written");
                    return Ok(PutResult {
                        rev,
                        sequence: seq,
                        inserted: true,
                    });
                }
                Err(StoreError::CasMismatch { .. } | StoreError::KeyExists(_)) => {
                    debug!(doc_id, seq, attempt, "CAS lost, retrying");
                    self.release(seq);
                }
                Err(e) => {
                    self.release(seq);
                    return Err(e.into());
                }
            }
        }

        warn!(collection = %self.name, doc_id, attempts = retry.max_attempts, "giving up on write");
        Err(CoreError::Conflict {
            doc_id: doc_id.to_string(),
            attempts: retry.max_attempts,
        })
    }

    fn release(&self, seq: u64) {
        if let Err(e) = self.allocator.release_unused(seq) {
            warn!(seq, error = %e, "failed to record unused sequence");
        }
        self.cache.process_unused(seq);
    }

    fn change_for(record: &DocumentRecord) -> DocChange {
        DocChange {
            sequence: record.sequence,
            doc_id: record.doc_id.clone(),
            rev_id: record
                .current_rev
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            deleted: record.deleted,
            channels: record.channels.clone(),
            removed_channels: record.removed_channels.clone(),
        }
    }

    /// Indexes a written record, then caches it.
    ///
    /// Both the local write path and the mutation feed come through here,
    /// so whichever sees a sequence first has indexed it before the cache
    /// can serve it. Index inserts are idempotent.
    fn ingest(&self, record: &DocumentRecord) -> bool {
        let change = Self::change_for(record);
        for (channel, entry) in change.entries(self.config.cache.enable_star_channel) {
            if let Err(e) = self.index.insert(&channel, entry.to_row()) {
                warn!(channel = %channel, seq = change.sequence, error = %e, "index insert failed");
            }
        }
        self.cache.process_change(&change)
    }

    /// Returns the current winning body.
    pub fn get(&self, doc_id: &str) -> CoreResult<DocBody> {
        let record = self.document(doc_id)?.ok_or_else(|| CoreError::NotFound {
            doc_id: doc_id.to_string(),
        })?;
        let rev = record.current_rev.clone().ok_or_else(|| CoreError::NotFound {
            doc_id: doc_id.to_string(),
        })?;
        Ok(self.get_rev(doc_id, &rev, 0)?.body)
    }

    /// Returns a specific revision with up to `history_limit` ancestors.
    pub fn get_rev(&self, doc_id: &str, rev: &RevId, history_limit: usize) -> CoreResult<Revision> {
        let unavailable = |reason| CoreError::RevisionUnavailable {
            doc_id: doc_id.to_string(),
            rev: rev.to_string(),
            reason,
        };

        if self.cache.is_quarantined(doc_id) {
            return Err(unavailable(UnavailableReason::Corrupt));
        }
        let record = match self.load(doc_id) {
            Ok(Some((record, _))) => record,
            Ok(None) => {
                let reason = if self.store.get(&self.purged_key(doc_id))?.is_some() {
                    UnavailableReason::Purged
                } else {
                    UnavailableReason::Missing
                };
                return Err(unavailable(reason));
            }
            Err(CoreError::RevisionTreeCorrupt { .. }) => {
                return Err(unavailable(UnavailableReason::Corrupt))
            }
            Err(e) => return Err(e),
        };

        let Some(info) = record.tree.get(rev) else {
            let reason = if record.tree.was_pruned(rev) {
                UnavailableReason::Pruned
            } else {
                UnavailableReason::Missing
            };
            return Err(unavailable(reason));
        };
        let Some(json) = info.body.as_deref() else {
            return Err(unavailable(UnavailableReason::Pruned));
        };

        let mut body = DocBody::from_json(json.as_bytes())?;
        body.id = Some(doc_id.to_string());
        body.rev = Some(rev.to_string());
        body.deleted = info.deleted;

        Ok(Revision {
            doc_id: doc_id.to_string(),
            rev: rev.clone(),
            body,
            history: record.tree.history(rev, history_limit.max(1)),
            deleted: info.deleted,
            sequence: record.sequence,
            channels: info.channels.clone(),
        })
    }

    /// Like [`Collection::get_rev`], but reports
    /// [`UnavailableReason::Removed`] when the user cannot see any of the
    /// revision's channels.
    pub fn get_rev_for(
        &self,
        user: &UserContext,
        doc_id: &str,
        rev: &RevId,
        history_limit: usize,
    ) -> CoreResult<Revision> {
        let revision = self.get_rev(doc_id, rev, history_limit)?;
        if !user.can_see_any(&revision.channels) {
            return Err(CoreError::RevisionUnavailable {
                doc_id: doc_id.to_string(),
                rev: rev.to_string(),
                reason: UnavailableReason::Removed,
            });
        }
        Ok(revision)
    }

    /// Returns the leaf revisions of a document.
    pub fn leaves(&self, doc_id: &str) -> CoreResult<Vec<RevInfo>> {
        let record = self.document(doc_id)?.ok_or_else(|| CoreError::NotFound {
            doc_id: doc_id.to_string(),
        })?;
        Ok(record.tree.leaves().into_iter().cloned().collect())
    }

    /// Returns which of `revs` this collection does not have.
    pub fn missing_revs(&self, doc_id: &str, revs: &[RevId]) -> CoreResult<Vec<RevId>> {
        let record = match self.document(doc_id) {
            Ok(record) => record,
            Err(CoreError::RevisionTreeCorrupt { .. }) => None,
            Err(e) => return Err(e),
        };
        Ok(revs
            .iter()
            .filter(|r| record.as_ref().map_or(true, |rec| !rec.tree.contains(r)))
            .cloned()
            .collect())
    }

    /// Removes a document and every trace of it in the index and cache.
    pub fn purge(&self, doc_id: &str) -> CoreResult<()> {
        let key = self.doc_key(doc_id);
        let Some(found) = self.store.get(&key)? else {
            return Err(CoreError::NotFound {
                doc_id: doc_id.to_string(),
            });
        };
        let mut channels = match DocumentRecord::decode(doc_id, &found.value) {
            Ok(record) => record.channel_history,
            Err(_) => BTreeSet::new(),
        };
        channels.insert(crate::cache::STAR_CHANNEL.to_string());

        self.store.delete(&key)?;
        self.store.set(&self.purged_key(doc_id), Vec::new())?;
        for channel in &channels {
            self.index.remove_doc(channel, doc_id)?;
        }
        self.cache.remove_doc(doc_id, &channels);
        self.cache.release(doc_id);
        warn!(collection = %self.name, doc_id, "document purged");
        Ok(())
    }

    /// Applies the configured depth and age limits to a document's tree.
    ///
    /// Returns the number of revisions removed. No sequence is allocated.
    pub fn prune(&self, doc_id: &str) -> CoreResult<usize> {
        let key = self.doc_key(doc_id);
        let retry = &self.config.cas_retry;
        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                std::thread::sleep(retry.delay_for_attempt(attempt));
            }
            let Some((mut record, cas)) = self.load(doc_id)? else {
                return Err(CoreError::NotFound {
                    doc_id: doc_id.to_string(),
                });
            };
            let removed = record.tree.prune(
                self.config.revs_limit,
                self.config.tombstone_max_age,
                crate::now_millis(),
            );
            if removed == 0 {
                return Ok(0);
            }
            match self.store.compare_and_swap(&key, cas, record.encode()?) {
                Ok(_) => return Ok(removed),
                Err(e) if e.is_cas_mismatch() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(CoreError::Conflict {
            doc_id: doc_id.to_string(),
            attempts: retry.max_attempts,
        })
    }

    /// Stores attachment bytes and returns their digest.
    pub fn put_attachment(&self, data: &[u8]) -> CoreResult<String> {
        let digest = attachment_digest(data);
        match self.store.add(&self.attachment_key(&digest), data.to_vec()) {
            Ok(_) | Err(StoreError::KeyExists(_)) => Ok(digest),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads attachment bytes by digest.
    pub fn get_attachment(&self, digest: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self
            .store
            .get(&self.attachment_key(digest))?
            .map(|found| found.value))
    }

    /// Returns true if the attachment is stored.
    pub fn has_attachment(&self, digest: &str) -> CoreResult<bool> {
        Ok(self.store.get(&self.attachment_key(digest))?.is_some())
    }

    /// Returns true if any retained revision of `doc_id` references
    /// `digest`.
    pub fn doc_references_attachment(&self, doc_id: &str, digest: &str) -> CoreResult<bool> {
        let Some(record) = self.document(doc_id)? else {
            return Ok(false);
        };
        for info in record.tree.iter() {
            if let Some(json) = info.body.as_deref() {
                if DocBody::from_json(json.as_bytes())?.references_digest(digest) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Applies a mutation seen on the store feed.
    ///
    /// Used for writes made by other nodes sharing the store; local writes
    /// arrive here too and are ignored as duplicates. Returns true if the
    /// cache changed.
    pub fn process_mutation(&self, mutation: &Mutation) -> bool {
        if let Some(seq) = mutation.key.strip_prefix(&unused_prefix(&self.name)) {
            return match seq.parse::<u64>() {
                Ok(seq) => self.cache.process_unused(seq),
                Err(_) => false,
            };
        }
        let Some(doc_id) = mutation.key.strip_prefix(&self.doc_prefix) else {
            return false;
        };
        let Some(value) = &mutation.value else {
            return false;
        };
        match DocumentRecord::decode(doc_id, value) {
            Ok(record) => self.ingest(&record),
            Err(e) => {
                error!(collection = %self.name, doc_id, error = %e, "corrupt document on feed");
                self.cache.quarantine(doc_id);
                false
            }
        }
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
