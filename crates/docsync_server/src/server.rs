//! Sync server: accepts connections and runs one session per connection.

use crate::config::ServerConfig;
use crate::error::{SessionError, SessionResult};
use crate::session::{spawn_with_hook, SessionHandle};
use crate::transport::Transport;
use docsync_core::{CoreResult, Database, UserContext};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// The sync server.
///
/// Holds the database, enforces the session limit and keeps one
/// skipped-sequence sweeper per collection running. Network listeners
/// authenticate the peer, wrap the socket in a [`Transport`] and hand it
/// to [`SyncServer::accept`].
///
/// Must be created inside a Tokio runtime.
pub struct SyncServer {
    db: Arc<Database>,
    config: ServerConfig,
    slots: Arc<Semaphore>,
    sessions: Arc<Mutex<HashMap<Uuid, Arc<SessionSlot>>>>,
    idle: Arc<Notify>,
    stop: watch::Sender<bool>,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    Pending,
    Registered(Uuid),
    Exited,
}

/// Close control for a registered session.
struct SessionSlot {
    close: Box<dyn Fn() + Send + Sync>,
}

impl SyncServer {
    /// Creates a server over `db`.
    pub fn new(db: Arc<Database>, config: ServerConfig) -> CoreResult<Self> {
        config.session.validate()?;
        let (stop, _) = watch::channel(false);
        let mut sweepers = Vec::new();
        for name in db.collection_names() {
            let cache = Arc::clone(db.collection(&name)?.cache());
            sweepers.push(tokio::spawn(cache.run_sweeper(stop.subscribe())));
        }
        info!(database = %db.name(), max_sessions = config.max_sessions, "sync server started");
        Ok(Self {
            slots: Arc::new(Semaphore::new(config.max_sessions)),
            db,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            idle: Arc::new(Notify::new()),
            stop,
            sweepers: Mutex::new(sweepers),
        })
    }

    /// Returns the database.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Starts a session for `user` on `transport`.
    pub fn accept(&self, transport: Transport, user: UserContext) -> SessionResult<SessionHandle> {
        if *self.stop.borrow() {
            return Err(SessionError::Cancelled);
        }
        let permit = Arc::clone(&self.slots).try_acquire_owned().map_err(|_| {
            warn!(limit = self.config.max_sessions, "rejecting session");
            SessionError::TooManySessions {
                limit: self.config.max_sessions,
            }
        })?;

        // The session id is only known after spawning, and a session may
        // end before it is registered.
        let registration = Arc::new(Mutex::new(Registration::Pending));
        let on_exit = {
            let sessions = Arc::clone(&self.sessions);
            let idle = Arc::clone(&self.idle);
            let registration = Arc::clone(&registration);
            move || {
                {
                    let mut sessions = sessions.lock();
                    let previous = std::mem::replace(&mut *registration.lock(), Registration::Exited);
                    if let Registration::Registered(id) = previous {
                        sessions.remove(&id);
                    }
                }
                drop(permit);
                idle.notify_waiters();
            }
        };

        let handle = spawn_with_hook(
            Arc::clone(&self.db),
            user,
            transport,
            self.config.session.clone(),
            on_exit,
        );
        {
            let mut sessions = self.sessions.lock();
            let mut registration = registration.lock();
            if *registration == Registration::Pending {
                sessions.insert(
                    handle.id(),
                    Arc::new(SessionSlot {
                        close: Box::new(handle.closer()),
                    }),
                );
                *registration = Registration::Registered(handle.id());
            }
        }
        Ok(handle)
    }

    /// Number of running sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Closes one session. Returns false if it is not running.
    pub fn close_session(&self, id: Uuid) -> bool {
        let slot = self.sessions.lock().get(&id).cloned();
        match slot {
            Some(slot) => {
                (slot.close)();
                true
            }
            None => false,
        }
    }

    /// Stops accepting, closes every session and waits for them to end.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        let slots: Vec<Arc<SessionSlot>> = self.sessions.lock().values().cloned().collect();
        info!(sessions = slots.len(), "shutting down");
        for slot in slots {
            (slot.close)();
        }
        loop {
            let notified = self.idle.notified();
            if self.sessions.lock().is_empty() {
                break;
            }
            notified.await;
        }
        let sweepers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.sweepers.lock());
        for sweeper in sweepers {
            let _ = sweeper.await;
        }
        info!("sync server stopped");
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("database", &self.db.name())
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}
