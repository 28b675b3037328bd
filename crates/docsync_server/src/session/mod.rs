//! Replication sessions.
//!
//! A session owns one connection. Its main task reads frames: replies
//! are routed to the request that awaits them, requests go through the
//! dispatch table. Change delivery runs on a second task once the peer
//! subscribes, and revision sends run on short-lived tasks bounded by
//! the flow-control window.

mod changes;
mod handlers;

use crate::config::SessionConfig;
use crate::dispatch::DispatchTable;
use crate::error::{SessionError, SessionResult};
use crate::flow::FlowControl;
use crate::state::SessionState;
use crate::transport::{FrameReceiver, FrameSender, Transport};
use docsync_core::{Collection, Database, UserContext};
use docsync_protocol::{Message, MessageKind, ProtocolVersion, DOMAIN_HTTP};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub(crate) use changes::ChangeStream;

/// Outcome of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: Uuid,
    /// Negotiated version, if the handshake completed.
    pub protocol: Option<ProtocolVersion>,
    /// Change batches sent, the caught-up sentinel included.
    pub batches_sent: u64,
    /// Revisions sent and acknowledged by the peer.
    pub revisions_sent: u64,
    /// Revisions received from the peer and stored.
    pub revisions_received: u64,
    /// Revision-unavailable signals sent.
    pub norevs_sent: u64,
    /// Revision-unavailable signals received.
    pub norevs_received: u64,
    /// Highest sequence covered by fully acknowledged batches.
    pub acknowledged_sequence: u64,
    /// Why the session failed, if it did.
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct SessionStats {
    batches_sent: AtomicU64,
    revisions_sent: AtomicU64,
    revisions_received: AtomicU64,
    norevs_sent: AtomicU64,
    norevs_received: AtomicU64,
    acknowledged_sequence: AtomicU64,
}

impl SessionStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Version and collections agreed at handshake.
#[derive(Clone)]
struct Negotiated {
    version: ProtocolVersion,
    collections: Vec<Arc<Collection>>,
}

/// State shared by a session's tasks.
pub(crate) struct Session {
    id: Uuid,
    db: Arc<Database>,
    config: SessionConfig,
    user: UserContext,
    out: FrameSender,
    pending: crate::pending::PendingRequests,
    flow: FlowControl,
    state: watch::Sender<SessionState>,
    closed: watch::Sender<bool>,
    negotiated: Mutex<Option<Negotiated>>,
    /// `(collection index, digest)` pairs this session has sent in
    /// revision bodies.
    advertised: Mutex<HashSet<(usize, String)>>,
    stream: Mutex<Option<Arc<ChangeStream>>>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
    stats: SessionStats,
}

/// Control handle for a running session.
#[derive(Debug)]
pub struct SessionHandle {
    id: Uuid,
    session: Arc<Session>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<SessionSummary>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user.name())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Waits until the session reaches `target` or closes. Returns the
    /// state reached.
    pub async fn wait_for_state(&mut self, target: SessionState) -> SessionState {
        match self
            .state
            .wait_for(|s| *s == target || s.is_closed())
            .await
        {
            Ok(state) => *state,
            Err(_) => SessionState::Closed,
        }
    }

    /// Closes the session. Pending requests are cancelled and
    /// unacknowledged progress is discarded.
    pub fn close(&self) {
        self.session.close();
    }

    pub(crate) fn closer(&self) -> impl Fn() + Send + Sync + 'static {
        let session = Arc::clone(&self.session);
        move || session.close()
    }

    /// Waits for the session to end.
    pub async fn join(self) -> SessionResult<SessionSummary> {
        self.task.await.map_err(|_| SessionError::Cancelled)
    }
}

/// Starts a session on `transport` for `user`.
///
/// Must be called inside a Tokio runtime.
pub fn spawn_session(
    db: Arc<Database>,
    user: UserContext,
    transport: Transport,
    config: SessionConfig,
) -> SessionHandle {
    spawn_with_hook(db, user, transport, config, || {})
}

pub(crate) fn spawn_with_hook<F>(
    db: Arc<Database>,
    user: UserContext,
    transport: Transport,
    config: SessionConfig,
    on_exit: F,
) -> SessionHandle
where
    F: FnOnce() + Send + 'static,
{
    let id = Uuid::new_v4();
    let (out, inbound) = transport.split(config.compression_level);
    let (state, state_rx) = watch::channel(SessionState::Handshake);
    let (closed, _) = watch::channel(false);
    let session = Arc::new(Session {
        id,
        db,
        flow: FlowControl::new(config.max_in_flight_revs, config.max_in_flight_bytes),
        config,
        user,
        out,
        pending: crate::pending::PendingRequests::new(),
        state,
        closed,
        negotiated: Mutex::new(None),
        advertised: Mutex::new(HashSet::new()),
        stream: Mutex::new(None),
        stream_task: Mutex::new(None),
        stats: SessionStats::default(),
    });

    let span = info_span!("session", session_id = %id, user = %session.user.name());
    let runner = Arc::clone(&session);
    let task = tokio::spawn(
        async move {
            let summary = runner.run(inbound).await;
            on_exit();
            summary
        }
        .instrument(span),
    );

    SessionHandle {
        id,
        session,
        state: state_rx,
        task,
    }
}

impl Session {
    async fn run(self: Arc<Self>, mut inbound: FrameReceiver) -> SessionSummary {
        info!("session started");
        let table = handlers::dispatch_table();
        let mut closed = self.closed.subscribe();

        let outcome: SessionResult<()> = loop {
            if self.is_closed() {
                break Ok(());
            }
            tokio::select! {
                _ = closed.changed() => continue,
                frame = inbound.recv() => match frame {
                    None => break Err(SessionError::Disconnected),
                    Some(Err(e)) => warn!(error = %e, "dropping undecodable frame"),
                    Some(Ok(msg)) => {
                        if let Err(e) = self.handle_frame(&table, msg).await {
                            break Err(e);
                        }
                    }
                },
            }
        };
        drop(table);

        let error = match outcome {
            Ok(()) | Err(SessionError::Cancelled) => None,
            Err(SessionError::Disconnected) => {
                debug!("peer disconnected");
                None
            }
            Err(e) => {
                warn!(error = %e, "session failed");
                Some(e.to_string())
            }
        };
        self.shutdown().await;
        let summary = self.summary(error);
        info!(
            batches = summary.batches_sent,
            revisions_sent = summary.revisions_sent,
            revisions_received = summary.revisions_received,
            norevs = summary.norevs_sent,
            acknowledged = summary.acknowledged_sequence,
            "session closed"
        );
        summary
    }

    async fn handle_frame(
        self: &Arc<Self>,
        table: &DispatchTable<Session>,
        msg: Message,
    ) -> SessionResult<()> {
        if msg.kind != MessageKind::Request {
            if !self.pending.complete(msg) {
                debug!("reply for a request no longer pending");
            }
            return Ok(());
        }

        let route = match table.resolve(&msg, self.state()) {
            Ok(route) => route,
            Err(e) => return self.finish(&msg, Err(e)).await,
        };
        if route.detached {
            let session = Arc::clone(self);
            tokio::spawn(
                async move {
                    let header = msg.clone();
                    let result = (route.handler)(Arc::clone(&session), msg).await;
                    if let Err(e) = session.finish(&header, result).await {
                        if e.is_fatal() {
                            session.close();
                        }
                    }
                }
                .in_current_span(),
            );
            Ok(())
        } else {
            let header = msg.clone();
            let result = (route.handler)(Arc::clone(self), msg).await;
            self.finish(&header, result).await
        }
    }

    /// Sends a handler's reply or error. Returns the error if it ends the
    /// session.
    async fn finish(
        &self,
        request: &Message,
        result: SessionResult<Option<Message>>,
    ) -> SessionResult<()> {
        match result {
            Ok(Some(reply)) => self.out.send(&reply).await,
            Ok(None) => Ok(()),
            Err(e) => {
                let profile = request.profile.as_deref().unwrap_or("");
                if e.is_fatal() {
                    warn!(profile, error = %e, "request failed; closing session");
                } else {
                    debug!(profile, error = %e, "request failed");
                }
                if !request.no_reply {
                    let reply = Message::error_to(request, DOMAIN_HTTP, e.status_code(), &e.to_string());
                    // The peer may already be gone; the original error matters more.
                    let _ = self.out.send(&reply).await;
                }
                if e.is_fatal() {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Sends a request and waits for its reply.
    async fn request(&self, mut msg: Message) -> SessionResult<Message> {
        let (serial, rx) = self.pending.register()?;
        msg.serial = serial;
        if let Err(e) = self.out.send(&msg).await {
            self.pending.forget(serial);
            return Err(e);
        }
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(SessionError::Cancelled),
            Err(_) => {
                self.pending.forget(serial);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Sends a request that expects no reply.
    async fn notify(&self, mut msg: Message) -> SessionResult<()> {
        msg.serial = self.pending.next_serial();
        msg.no_reply = true;
        self.out.send(&msg).await
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn transition(&self, next: SessionState) -> SessionResult<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(from = %current, to = %next, "session state");
                *current = next;
                true
            } else {
                result = Err(SessionError::InvalidState {
                    from: current.to_string(),
                    to: next.to_string(),
                });
                false
            }
        });
        result
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("close requested");
        }
        self.flow.close();
    }

    async fn shutdown(&self) {
        self.close();
        let cancelled = self.pending.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "cancelled pending requests");
        }
        let task = self.stream_task.lock().take();
        if let Some(mut task) = task {
            // Delivery stops on its own once it sees the close flag, unless
            // it is stuck writing to a peer that stopped reading.
            if tokio::time::timeout(self.config.request_timeout, &mut task)
                .await
                .is_err()
            {
                warn!("change delivery did not stop; aborting");
                task.abort();
            }
        }
        let stream = self.stream.lock().clone();
        if let Some(stream) = stream {
            stream.flush_checkpoint(self);
        }
        // Closed is reachable from every state but itself.
        let _ = self.transition(SessionState::Closed);
    }

    fn summary(&self, error: Option<String>) -> SessionSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SessionSummary {
            id: self.id,
            protocol: self.negotiated.lock().as_ref().map(|n| n.version),
            batches_sent: load(&self.stats.batches_sent),
            revisions_sent: load(&self.stats.revisions_sent),
            revisions_received: load(&self.stats.revisions_received),
            norevs_sent: load(&self.stats.norevs_sent),
            norevs_received: load(&self.stats.norevs_received),
            acknowledged_sequence: load(&self.stats.acknowledged_sequence),
            error,
        }
    }

    fn negotiated(&self) -> SessionResult<Negotiated> {
        self.negotiated
            .lock()
            .clone()
            .ok_or_else(|| SessionError::InvalidState {
                from: self.state().to_string(),
                to: "negotiated".into(),
            })
    }

    /// Resolves the collection a request addresses.
    fn collection_for(&self, msg: &Message) -> SessionResult<(usize, Arc<Collection>)> {
        let negotiated = self.negotiated()?;
        let index = if negotiated.version.has_collections() {
            msg.collection_index()?.ok_or_else(|| {
                docsync_protocol::ProtocolError::MissingProperty(
                    docsync_protocol::PROP_COLLECTION.into(),
                )
            })?
        } else {
            0
        };
        let collection = negotiated.collections.get(index).cloned().ok_or_else(|| {
            docsync_protocol::ProtocolError::invalid(
                docsync_protocol::PROP_COLLECTION,
                &index.to_string(),
            )
        })?;
        Ok((index, collection))
    }

    /// Collection qualifier for outgoing requests.
    fn collection_qualifier(&self, index: usize) -> Option<usize> {
        self.negotiated
            .lock()
            .as_ref()
            .filter(|n| n.version.has_collections())
            .map(|_| index)
    }
}
