//! Session lifecycle states.

use std::fmt;

/// Where a session is in its lifecycle.
///
/// `Handshake → Idle → Streaming → Draining → Closed`; any state may go
/// straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for version negotiation.
    Handshake,
    /// Negotiated; no subscription yet.
    Idle,
    /// Delivering changes.
    Streaming,
    /// One-shot delivery finished; still serving requests.
    Draining,
    /// Terminated.
    Closed,
}

impl SessionState {
    /// Every state that still serves peer requests after the handshake.
    pub const ACTIVE: &'static [SessionState] = &[
        SessionState::Idle,
        SessionState::Streaming,
        SessionState::Draining,
    ];

    /// Returns true if moving to `next` is allowed.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Handshake, Idle) | (Idle, Streaming) | (Streaming, Draining) | (_, Closed)
        ) && self != Closed
    }

    /// Returns true once the session has terminated.
    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions() {
        assert!(SessionState::Handshake.can_transition_to(SessionState::Idle));
        assert!(SessionState::Idle.can_transition_to(SessionState::Streaming));
        assert!(SessionState::Streaming.can_transition_to(SessionState::Draining));
    }

    #[test]
    fn skipping_or_reversing_is_rejected() {
        assert!(!SessionState::Handshake.can_transition_to(SessionState::Streaming));
        assert!(!SessionState::Streaming.can_transition_to(SessionState::Idle));
        assert!(!SessionState::Draining.can_transition_to(SessionState::Streaming));
    }

    #[test]
    fn closed_is_reachable_and_final() {
        for state in [
            SessionState::Handshake,
            SessionState::Idle,
            SessionState::Streaming,
            SessionState::Draining,
        ] {
            assert!(state.can_transition_to(SessionState::Closed));
        }
        assert!(!SessionState::Closed.can_transition_to(SessionState::Closed));
        assert!(!SessionState::Closed.can_transition_to(SessionState::Idle));
    }
}
