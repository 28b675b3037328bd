//! Outstanding requests awaiting a reply.

use crate::error::{SessionError, SessionResult};
use docsync_protocol::{Message, MessageKind, DOMAIN_HTTP};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

type Reply = oneshot::Sender<SessionResult<Message>>;

/// Correlates outgoing requests with their responses by serial.
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Mutex<PendingInner>,
}

#[derive(Debug, Default)]
struct PendingInner {
    next_serial: u64,
    waiting: HashMap<u64, Reply>,
    closed: bool,
}

impl PendingRequests {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a serial and registers a waiter for its reply.
    pub fn register(&self) -> SessionResult<(u64, oneshot::Receiver<SessionResult<Message>>)> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SessionError::Cancelled);
        }
        inner.next_serial += 1;
        let serial = inner.next_serial;
        let (tx, rx) = oneshot::channel();
        inner.waiting.insert(serial, tx);
        Ok((serial, rx))
    }

    /// Allocates a serial for a request that expects no reply.
    pub fn next_serial(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_serial += 1;
        inner.next_serial
    }

    /// Forgets a waiter, e.g. after a timeout.
    pub fn forget(&self, serial: u64) {
        self.inner.lock().waiting.remove(&serial);
    }

    /// Routes a response or error reply to its waiter. Returns false if
    /// nobody was waiting for that serial.
    pub fn complete(&self, reply: Message) -> bool {
        let Some(waiter) = self.inner.lock().waiting.remove(&reply.serial) else {
            return false;
        };
        let outcome = match reply.kind {
            MessageKind::Error => {
                let (_, code) = reply.error_code().unwrap_or((DOMAIN_HTTP, 500));
                Err(SessionError::Remote {
                    code,
                    message: String::from_utf8_lossy(&reply.body).into_owned(),
                })
            }
            _ => Ok(reply),
        };
        // The waiter may have timed out and gone away.
        let _ = waiter.send(outcome);
        true
    }

    /// Fails every waiter with [`SessionError::Cancelled`] and refuses new
    /// registrations.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Reply> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.waiting.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.send(Err(SessionError::Cancelled));
        }
        count
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Returns true if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
