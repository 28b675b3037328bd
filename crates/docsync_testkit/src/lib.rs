//! # docsync testkit
//!
//! Test utilities for docsync.
//!
//! This crate provides:
//! - In-memory database fixtures with document helpers
//! - Property-based test generators using proptest
//! - A scripted replication peer that drives a session over the wire
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn pulls_everything() {
//!     let db = TestDatabase::new();
//!     db.put_json("doc1", serde_json::json!({"channels": ["a"]}));
//!     let (mut peer, _handle) = TestPeer::connect(&db, db.admin(), SessionConfig::default());
//!     peer.handshake_default().await;
//!     let pulled = peer.pull(SubscribeChanges::default()).await;
//!     assert_eq!(pulled.revisions.len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod peer;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_test_logging;
    pub use crate::peer::*;
    pub use docsync_server::{SessionConfig, SessionState};
    pub use docsync_protocol::SubscribeChanges;
}

pub use fixtures::*;
pub use generators::*;
pub use peer::*;

/// Installs a test-captured subscriber filtered by `RUST_LOG`. Safe to
/// call from every test.
pub fn init_test_logging() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}
