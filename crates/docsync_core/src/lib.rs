//! # docsync core
//!
//! Document revision trees, sequence allocation, channel change caches
//! and change feeds.
//!
//! This crate provides:
//! - Per-document revision trees with deterministic winners
//! - Optimistic compare-and-swap document writes with bounded retry
//! - Per-channel, sequence-ordered change caches with index backfill
//! - Skipped-sequence tracking so ordered readers never block forever
//! - Change feeds merging a user's channels into one stream
//! - Checkpoint storage for replication peers
//!
//! Storage is reached through the traits in `docsync_store`; this crate
//! never talks to a concrete backend.

mod cache;
mod checkpoint;
mod collection;
mod config;
mod database;
mod document;
mod error;
mod feed;
mod revision;
mod sequence;
mod user;

pub use cache::{
    collapse, Arrival, CacheStats, ChangeCache, ChangeEntry, ChangesSince, ChannelCache,
    DocChange, SequenceTracker, STAR_CHANNEL,
};
pub use checkpoint::{Checkpoint, CheckpointOwner, CheckpointStore};
pub use collection::{Collection, PutResult, Revision};
pub use config::{CacheConfig, DatabaseConfig, RetryConfig, DEFAULT_COLLECTION};
pub use database::{ChangeListener, Database};
pub use document::{attachment_digest, AttachmentMeta, DocBody, DocumentRecord, CHANNELS_PROPERTY};
pub use error::{CoreError, CoreResult, UnavailableReason};
pub use feed::{ChangeFeed, FeedEvent, FeedOptions, FeedOrder};
pub use revision::{RevId, RevInfo, RevTree};
pub use sequence::SequenceAllocator;
pub use user::{ChannelMapper, PropertyChannelMapper, UserContext};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
