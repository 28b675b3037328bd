//! Revision identifiers and per-document revision trees.

mod rev_id;
mod tree;

pub use rev_id::RevId;
pub use tree::{RevInfo, RevTree};
