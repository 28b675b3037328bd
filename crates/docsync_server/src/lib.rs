//! # docsync server
//!
//! Replication sessions over a framed, duplex connection.
//!
//! This crate provides:
//! - The session state machine (`Handshake → Idle → Streaming →
//!   Draining → Closed`) with a per-session dispatch table
//! - Batched change delivery with per-batch acknowledgement
//! - Flow control bounding in-flight revision sends by count and bytes
//! - Server-side checkpoints advanced only for acknowledged batches
//! - Attachment transfer with per-session access checks
//! - [`SyncServer`], which runs many sessions against one database
//!
//! # Protocol
//!
//! 1. The peer offers protocol versions; the server picks one
//! 2. The peer subscribes from a sequence or from its stored checkpoint
//! 3. The server sends change batches; the peer answers with the
//!    revisions it wants
//! 4. The server sends those revisions, or a revision-unavailable signal
//! 5. One-shot subscriptions end with an empty "caught up" batch

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod dispatch;
mod error;
mod flow;
mod pending;
mod server;
mod session;
mod state;
mod transport;

pub use config::{ServerConfig, SessionConfig};
pub use dispatch::{DispatchTable, Handler, HandlerFuture, Route};
pub use error::{SessionError, SessionResult};
pub use flow::{BatchTracker, FlowControl, FlowPermit};
pub use pending::PendingRequests;
pub use server::SyncServer;
pub use session::{spawn_session, SessionHandle, SessionSummary};
pub use state::SessionState;
pub use transport::{duplex_pair, FrameReceiver, FrameSender, Transport, DEFAULT_CAPACITY};
