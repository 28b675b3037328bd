//! Replication checkpoints.

use crate::error::{CoreError, CoreResult};
use docsync_store::{KvStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Who writes a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointOwner {
    /// Stored on behalf of the peer via set-checkpoint.
    Peer,
    /// Written by the server as batches are acknowledged.
    Server,
}

impl CheckpointOwner {
    fn as_str(self) -> &'static str {
        match self {
            CheckpointOwner::Peer => "peer",
            CheckpointOwner::Server => "server",
        }
    }
}

/// A durable replication cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Replicator identity.
    pub client: String,
    /// Revision of this checkpoint, `0-N`.
    pub rev: String,
    /// Last fully acknowledged sequence.
    pub last_sequence: u64,
    /// Opaque peer state.
    #[serde(default)]
    pub body: Vec<u8>,
}

fn rev_number(rev: &str) -> Option<u64> {
    rev.strip_prefix("0-").and_then(|n| n.parse().ok())
}

/// Reads and writes checkpoints in the store.
///
/// Checkpoints are only ever replaced, never removed.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn KvStore>,
    collection: String,
}

impl CheckpointStore {
    /// Creates a checkpoint store for a collection.
    pub fn new(store: Arc<dyn KvStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    fn key(&self, owner: CheckpointOwner, user: &str, client: &str) -> String {
        format!(
            "_sync:local:checkpoint/{}/{}/{user}/{client}",
            self.collection,
            owner.as_str()
        )
    }

    /// Loads a checkpoint.
    pub fn get(
        &self,
        owner: CheckpointOwner,
        user: &str,
        client: &str,
    ) -> CoreResult<Option<Checkpoint>> {
        let Some(found) = self.store.get(&self.key(owner, user, client))? else {
            return Ok(None);
        };
        let checkpoint = ciborium::from_reader(found.value.as_slice()).map_err(CoreError::encoding)?;
        Ok(Some(checkpoint))
    }

    /// Stores a checkpoint and returns its new revision.
    ///
    /// `expected_rev` must name the stored revision, or be `None` when no
    /// checkpoint exists yet; otherwise [`CoreError::CheckpointMismatch`].
    pub fn set(
        &self,
        owner: CheckpointOwner,
        user: &str,
        client: &str,
        expected_rev: Option<&str>,
        last_sequence: u64,
        body: Vec<u8>,
    ) -> CoreResult<String> {
        let key = self.key(owner, user, client);
        let mismatch = || CoreError::CheckpointMismatch {
            client: client.to_string(),
        };

        let current = self.store.get(&key)?;
        let (cas, next) = match &current {
            Some(found) => {
                let stored: Checkpoint =
                    ciborium::from_reader(found.value.as_slice()).map_err(CoreError::encoding)?;
                if expected_rev != Some(stored.rev.as_str()) {
                    return Err(mismatch());
                }
                (found.cas, rev_number(&stored.rev).unwrap_or(0) + 1)
            }
            None if expected_rev.is_some() => return Err(mismatch()),
            None => (0, 1),
        };

        let checkpoint = Checkpoint {
            client: client.to_string(),
            rev: format!("0-{next}"),
            last_sequence,
            body,
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&checkpoint, &mut buf).map_err(CoreError::encoding)?;

        match self.store.compare_and_swap(&key, cas, buf) {
            Ok(_) => {}
            Err(StoreError::CasMismatch { .. } | StoreError::KeyExists(_)) => return Err(mismatch()),
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(client, last_sequence, rev = %checkpoint.rev, "checkpoint stored");
        Ok(checkpoint.rev)
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}
