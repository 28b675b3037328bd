//! # docsync protocol
//!
//! Wire messages for replication sessions.
//!
//! This crate provides:
//! - [`Message`] frames with serial correlation, string properties and an
//!   optional zstd-compressed body, encoded as CBOR
//! - [`Profile`] names for every request kind
//! - Typed request and response structs in [`messages`]
//! - [`ProtocolVersion`] negotiation
//!
//! This is a pure protocol crate with no I/O operations.

mod error;
mod frame;
pub mod messages;
mod profile;
mod version;

pub use error::{ProtocolError, ProtocolResult};
pub use frame::{
    Message, MessageKind, DOMAIN_HTTP, PROP_COLLECTION, PROP_ERROR_CODE, PROP_ERROR_DOMAIN,
};
pub use messages::{
    ChangeRow, ChangesAck, ChangesBatch, CheckpointReply, GetAttachment, GetCheckpoint,
    HandshakeRequest, HandshakeResponse, RevisionMessage, RevisionUnavailable, SetCheckpoint,
    SubscribeChanges, SubscribeResponse,
};
pub use profile::Profile;
pub use version::{negotiate, ProtocolVersion};
