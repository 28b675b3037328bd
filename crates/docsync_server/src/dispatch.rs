//! Per-session dispatch table.
//!
//! Built once when a session starts and dropped with it. Each profile
//! maps to one handler and the states in which the handler may run.

use crate::error::{SessionError, SessionResult};
use crate::state::SessionState;
use docsync_protocol::{Message, Profile, ProtocolError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by a handler: the reply to send, if any.
pub type HandlerFuture = Pin<Box<dyn Future<Output = SessionResult<Option<Message>>> + Send>>;

/// A request handler over a shared context `C`.
pub type Handler<C> = fn(Arc<C>, Message) -> HandlerFuture;

/// One entry of the table.
pub struct Route<C> {
    /// Profile served.
    pub profile: Profile,
    /// States in which the profile is accepted.
    pub allowed: &'static [SessionState],
    /// Run on its own task so the connection keeps reading. Needed by
    /// handlers that send requests of their own and wait for replies.
    pub detached: bool,
    /// The handler.
    pub handler: Handler<C>,
}

impl<C> Clone for Route<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Route<C> {}

impl<C> std::fmt::Debug for Route<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("profile", &self.profile)
            .field("allowed", &self.allowed)
            .field("detached", &self.detached)
            .finish_non_exhaustive()
    }
}

/// Profile → route.
pub struct DispatchTable<C> {
    routes: HashMap<Profile, Route<C>>,
}

impl<C> DispatchTable<C> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// Registers a handler that runs inline.
    #[must_use]
    pub fn on(self, profile: Profile, allowed: &'static [SessionState], handler: Handler<C>) -> Self {
        self.insert(profile, allowed, false, handler)
    }

    /// Registers a handler that runs on its own task.
    #[must_use]
    pub fn on_detached(
        self,
        profile: Profile,
        allowed: &'static [SessionState],
        handler: Handler<C>,
    ) -> Self {
        self.insert(profile, allowed, true, handler)
    }

    fn insert(
        mut self,
        profile: Profile,
        allowed: &'static [SessionState],
        detached: bool,
        handler: Handler<C>,
    ) -> Self {
        self.routes.insert(
            profile,
            Route {
                profile,
                allowed,
                detached,
                handler,
            },
        );
        self
    }

    /// Finds the route for a request in the current state.
    pub fn resolve(&self, msg: &Message, state: SessionState) -> SessionResult<Route<C>> {
        let profile = msg.known_profile()?;
        let route = self
            .routes
            .get(&profile)
            .ok_or_else(|| ProtocolError::UnknownProfile(profile.as_str().to_string()))?;
        if !route.allowed.contains(&state) {
            return Err(SessionError::InvalidState {
                from: state.to_string(),
                to: profile.as_str().to_string(),
            });
        }
        Ok(*route)
    }

    /// Number of registered profiles.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<C> Default for DispatchTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
    }

    fn count(ctx: Arc<Counter>, msg: Message) -> HandlerFuture {
        Box::pin(async move {
            ctx.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Message::response_to(&msg)))
        })
    }

    fn table() -> DispatchTable<Counter> {
        DispatchTable::new()
            .on(Profile::Handshake, &[SessionState::Handshake], count)
            .on_detached(Profile::Revision, SessionState::ACTIVE, count)
    }

    #[tokio::test]
    async fn resolves_and_runs_handler() {
        let table = table();
        let ctx = Arc::new(Counter::default());
        let msg = Message::request(Profile::Handshake);

        let route = table.resolve(&msg, SessionState::Handshake).unwrap();
        assert!(!route.detached);
        let reply = (route.handler)(Arc::clone(&ctx), msg).await.unwrap();
        assert!(reply.is_some());
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn state_gates_profiles() {
        let table = table();
        let msg = Message::request(Profile::Handshake);
        assert!(matches!(
            table.resolve(&msg, SessionState::Idle),
            Err(SessionError::InvalidState { .. })
        ));
        let rev = Message::request(Profile::Revision);
        assert!(table.resolve(&rev, SessionState::Handshake).is_err());
        assert!(table.resolve(&rev, SessionState::Streaming).unwrap().detached);
    }

    #[test]
    fn unregistered_profile_is_unknown() {
        let table = table();
        let msg = Message::request(Profile::GetCheckpoint);
        assert!(matches!(
            table.resolve(&msg, SessionState::Idle),
            Err(SessionError::Protocol(ProtocolError::UnknownProfile(_)))
        ));
        let mut bogus = Message::request(Profile::GetCheckpoint);
        bogus.profile = Some("bogus".into());
        assert!(table.resolve(&bogus, SessionState::Idle).is_err());
    }
}
