//! # docsync store
//!
//! External collaborator interfaces consumed by the docsync engine.
//!
//! The engine does not implement durability itself. It talks to:
//! - a [`KvStore`]: get/set/compare-and-swap by key, atomic counters and a
//!   mutation notification feed
//! - a [`SecondaryIndex`]: per-channel rows ordered by sequence, used to
//!   backfill change caches
//!
//! Both are opaque to document semantics: values are bytes, index rows are
//! plain tuples.
//!
//! ## Available Implementations
//!
//! - [`MemoryStore`] - in-process store for tests and embedded use
//! - [`MemoryIndex`] - in-process channel index
//!
//! ## Example
//!
//! ```rust
//! use docsync_store::{KvStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! let cas = store.set("doc:a", b"hello".to_vec()).unwrap();
//! let current = store.get("doc:a").unwrap().unwrap();
//! assert_eq!(current.cas, cas);
//! assert_eq!(current.value, b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod index;
mod kv;
mod memory;

pub use error::{StoreError, StoreResult};
pub use index::{IndexRow, SecondaryIndex};
pub use kv::{Cas, KvStore, Mutation, Versioned};
pub use memory::{MemoryIndex, MemoryStore};
