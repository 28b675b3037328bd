//! Database facade.

use crate::collection::Collection;
use crate::config::{DatabaseConfig, DEFAULT_COLLECTION};
use crate::error::{CoreError, CoreResult};
use crate::user::{ChannelMapper, PropertyChannelMapper};
use docsync_store::{KvStore, Mutation, SecondaryIndex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How often the change listener checks for shutdown.
const LISTENER_POLL: Duration = Duration::from_millis(100);

/// The main database handle.
///
/// A `Database` owns one [`Collection`] per configured collection name.
/// Documents, sequences, caches and checkpoints are all per collection.
///
/// ```rust,ignore
/// let db = Database::open(
///     DatabaseConfig::new("travel").with_collection("hotels"),
///     Arc::new(MemoryStore::new()),
///     Arc::new(MemoryIndex::new()),
/// )?;
/// let hotels = db.collection("hotels")?;
/// let result = hotels.put("h1", None, DocBody::new().with("channels", "eu"), None)?;
/// ```
pub struct Database {
    config: Arc<DatabaseConfig>,
    store: Arc<dyn KvStore>,
    collections: Vec<Arc<Collection>>,
}

impl Database {
    /// Opens a database using the `channels` body property for channel
    /// assignment.
    pub fn open(
        config: DatabaseConfig,
        store: Arc<dyn KvStore>,
        index: Arc<dyn SecondaryIndex>,
    ) -> CoreResult<Self> {
        Self::open_with_mapper(config, store, index, Arc::new(PropertyChannelMapper))
    }

    /// Opens a database with a custom channel mapper.
    pub fn open_with_mapper(
        mut config: DatabaseConfig,
        store: Arc<dyn KvStore>,
        index: Arc<dyn SecondaryIndex>,
        mapper: Arc<dyn ChannelMapper>,
    ) -> CoreResult<Self> {
        if !config.collections.iter().any(|c| c == DEFAULT_COLLECTION) {
            config.collections.insert(0, DEFAULT_COLLECTION.to_string());
        }
        config.validate()?;
        let config = Arc::new(config);

        let collections = config
            .collections
            .iter()
            .map(|name| {
                Collection::open(
                    name,
                    Arc::clone(&config),
                    Arc::clone(&store),
                    Arc::clone(&index),
                    Arc::clone(&mapper),
                )
                .map(Arc::new)
            })
            .collect::<CoreResult<Vec<_>>>()?;

        tracing::info!(
            db = %config.name,
            collections = collections.len(),
            "database opened"
        );
        Ok(Self {
            config,
            store,
            collections,
        })
    }

    /// Returns the database name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Returns the store.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Looks up a collection by name.
    pub fn collection(&self, name: &str) -> CoreResult<Arc<Collection>> {
        self.collections
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| CoreError::CollectionNotFound {
                name: name.to_string(),
            })
    }

    /// Returns the `_default` collection.
    pub fn default_collection(&self) -> CoreResult<Arc<Collection>> {
        self.collection(DEFAULT_COLLECTION)
    }

    /// Names of all collections, in configuration order.
    pub fn collection_names(&self) -> Vec<String> {
        self.collections.iter().map(|c| c.name().to_string()).collect()
    }

    /// Routes a store mutation to the collection it belongs to.
    pub fn process_mutation(&self, mutation: &Mutation) -> bool {
        self.collections
            .iter()
            .any(|c| c.process_mutation(mutation))
    }

    /// Starts a thread that feeds store mutations into the caches.
    pub fn spawn_change_listener(self: &Arc<Self>) -> ChangeListener {
        let rx = self.store.subscribe();
        let stop = Arc::new(AtomicBool::new(false));
        let db = Arc::clone(self);
        let thread_stop = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            while !thread_stop.load(Ordering::Acquire) {
                match rx.recv_timeout(LISTENER_POLL) {
                    Ok(mutation) => {
                        db.process_mutation(&mutation);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            tracing::debug!(db = %db.name(), "change listener stopped");
        });

        ChangeListener {
            stop,
            handle: Some(handle),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.config.name)
            .field("collections", &self.collection_names())
            .finish()
    }
}

/// Handle to the background change listener. Stops it when dropped.
#[derive(Debug)]
pub struct ChangeListener {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ChangeListener {
    /// Stops the listener and waits for its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("change listener thread panicked");
            }
        }
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}
