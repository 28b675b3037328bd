//! Test fixtures and database helpers.
//!
//! Provides an in-memory database plus shortcuts for the writes most
//! replication tests start from.

use docsync_core::{
    AttachmentMeta, Collection, Database, DatabaseConfig, DocBody, PutResult, UserContext,
    DEFAULT_COLLECTION,
};
use docsync_store::{
    Cas, KvStore, MemoryIndex, MemoryStore, Mutation, StoreError, StoreResult, Versioned,
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// A database backed by in-memory storage, with handles to the storage
/// kept for inspection.
pub struct TestDatabase {
    /// The database instance.
    pub db: Arc<Database>,
    /// The key-value store under the database.
    pub store: Arc<MemoryStore>,
    /// The channel index under the database.
    pub index: Arc<MemoryIndex>,
}

impl TestDatabase {
    /// Creates a database with only the default collection.
    pub fn new() -> Self {
        Self::with_config(DatabaseConfig::new("test"))
    }

    /// Creates a database with extra named collections.
    pub fn with_collections(names: &[&str]) -> Self {
        let config = names
            .iter()
            .fold(DatabaseConfig::new("test"), |config, name| {
                config.with_collection(*name)
            });
        Self::with_config(config)
    }

    /// Creates a database whose first `failures` document writes lose
    /// their compare-and-swap, as if another writer raced them.
    pub fn contended(config: DatabaseConfig, failures: u32) -> (Self, Arc<ContendedStore>) {
        let inner = Arc::new(MemoryStore::new());
        let contended = Arc::new(ContendedStore::new(inner.clone(), "_sync:doc:", failures));
        let index = Arc::new(MemoryIndex::new());
        let db = Database::open(config, contended.clone(), index.clone())
            .expect("Failed to open in-memory database");
        let test_db = Self {
            db: Arc::new(db),
            store: inner,
            index,
        };
        (test_db, contended)
    }

    /// Creates a database from an explicit configuration.
    pub fn with_config(config: DatabaseConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryIndex::new());
        let db = Database::open(config, store.clone(), index.clone())
            .expect("Failed to open in-memory database");
        Self {
            db: Arc::new(db),
            store,
            index,
        }
    }

    /// Returns a named collection.
    pub fn collection(&self, name: &str) -> Arc<Collection> {
        self.db
            .collection(name)
            .unwrap_or_else(|e| panic!("collection {name}: {e}"))
    }

    /// Returns the default collection.
    pub fn default_collection(&self) -> Arc<Collection> {
        self.collection(DEFAULT_COLLECTION)
    }

    /// A user that sees every channel.
    pub fn admin(&self) -> UserContext {
        UserContext::admin("admin")
    }

    /// A user granted exactly `channels`.
    pub fn user(&self, name: &str, channels: &[&str]) -> UserContext {
        UserContext::new(name, channels.iter().copied())
    }

    /// Writes `json` to `doc_id` in the default collection, on top of the
    /// current winner.
    pub fn put_json(&self, doc_id: &str, json: Value) -> PutResult {
        put_json(&self.default_collection(), doc_id, json)
    }

    /// Writes `json` to `doc_id` in a named collection.
    pub fn put_json_in(&self, collection: &str, doc_id: &str, json: Value) -> PutResult {
        put_json(&self.collection(collection), doc_id, json)
    }

    /// Stores `data` as an attachment and writes `json` with a stub for
    /// it under `name`. Returns the write and the attachment digest.
    pub fn put_with_attachment(
        &self,
        doc_id: &str,
        name: &str,
        data: &[u8],
        json: Value,
    ) -> (PutResult, String) {
        let collection = self.default_collection();
        let digest = collection
            .put_attachment(data)
            .expect("Failed to store attachment");
        let mut body = body_from(json);
        body.attachments.insert(
            name.to_string(),
            AttachmentMeta {
                digest: digest.clone(),
                length: data.len() as u64,
                content_type: None,
                revpos: 0,
                stub: true,
            },
        );
        let parent = winner(&collection, doc_id);
        let result = collection
            .put(doc_id, parent.as_ref(), body, None)
            .expect("Failed to write document");
        (result, digest)
    }

    /// Deletes the current winner of `doc_id` in the default collection.
    pub fn delete(&self, doc_id: &str) -> PutResult {
        let collection = self.default_collection();
        let parent = winner(&collection, doc_id).expect("document has no revisions");
        collection
            .delete(doc_id, &parent)
            .expect("Failed to delete document")
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// A store that fails a number of compare-and-swaps on matching keys
/// before letting writes through.
#[derive(Debug)]
pub struct ContendedStore {
    inner: Arc<MemoryStore>,
    prefix: String,
    remaining: AtomicU32,
    failed: AtomicU32,
}

impl ContendedStore {
    /// Fails the next `failures` CAS writes to keys starting with `prefix`.
    pub fn new(inner: Arc<MemoryStore>, prefix: &str, failures: u32) -> Self {
        Self {
            inner,
            prefix: prefix.to_string(),
            remaining: AtomicU32::new(failures),
            failed: AtomicU32::new(0),
        }
    }

    /// CAS writes failed so far.
    pub fn failed(&self) -> u32 {
        self.failed.load(Ordering::SeqCst)
    }
}

impl KvStore for ContendedStore {
    fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> StoreResult<Cas> {
        self.inner.set(key, value)
    }

    fn add(&self, key: &str, value: Vec<u8>) -> StoreResult<Cas> {
        self.inner.add(key, value)
    }

    fn compare_and_swap(&self, key: &str, expected: Cas, value: Vec<u8>) -> StoreResult<Cas> {
        let lose = key.starts_with(&self.prefix)
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if lose {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::CasMismatch {
                key: key.to_string(),
                expected,
                actual: expected + 1,
            });
        }
        self.inner.compare_and_swap(key, expected, value)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key)
    }

    fn increment_counter(&self, key: &str, delta: u64) -> StoreResult<u64> {
        self.inner.increment_counter(key, delta)
    }

    fn counter(&self, key: &str) -> StoreResult<u64> {
        self.inner.counter(key)
    }

    fn subscribe(&self) -> Receiver<Mutation> {
        self.inner.subscribe()
    }
}

/// Parses a JSON value into a document body.
pub fn body_from(json: Value) -> DocBody {
    let bytes = serde_json::to_vec(&json).expect("Failed to encode JSON");
    DocBody::from_json(&bytes).expect("Failed to parse document body")
}

/// Builds `{"channels": [...]}` plus extra properties.
pub fn doc_in(channels: &[&str], extra: Value) -> Value {
    let mut json = match extra {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    json.insert(
        "channels".to_string(),
        Value::from(channels.iter().map(|c| c.to_string()).collect::<Vec<_>>()),
    );
    Value::Object(json)
}

/// Writes `json` to `doc_id` on top of its current winner.
pub fn put_json(collection: &Collection, doc_id: &str, json: Value) -> PutResult {
    let parent = winner(collection, doc_id);
    collection
        .put(doc_id, parent.as_ref(), body_from(json), None)
        .expect("Failed to write document")
}

/// Writes `json` with explicit channels, bypassing the channel mapper.
pub fn put_in_channels(
    collection: &Collection,
    doc_id: &str,
    channels: &[&str],
    json: Value,
) -> PutResult {
    let parent = winner(collection, doc_id);
    let channels: BTreeSet<String> = channels.iter().map(|c| c.to_string()).collect();
    collection
        .put(doc_id, parent.as_ref(), body_from(json), Some(channels))
        .expect("Failed to write document")
}

/// Current winning revision of a document, if it exists.
pub fn winner(collection: &Collection, doc_id: &str) -> Option<docsync_core::RevId> {
    collection
        .document(doc_id)
        .expect("Failed to load document")
        .and_then(|record| record.current_rev)
}
