//! Revision identifiers.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Number of hex characters kept from the SHA-256 digest.
const DIGEST_HEX_LEN: usize = 32;

/// A revision identifier of the form `generation-digest`.
///
/// Revision IDs order by generation first, then by digest compared
/// lexicographically. This is the ordering used to pick winners.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevId {
    generation: u64,
    digest: String,
}

impl RevId {
    /// Creates a revision ID from its parts.
    pub fn new(generation: u64, digest: impl Into<String>) -> CoreResult<Self> {
        let digest = digest.into();
        if generation == 0 {
            return Err(CoreError::InvalidRevId(format!("{generation}-{digest}")));
        }
        if digest.is_empty() || digest.contains('-') {
            return Err(CoreError::InvalidRevId(format!("{generation}-{digest}")));
        }
        Ok(Self { generation, digest })
    }

    /// Computes the ID of a new revision.
    ///
    /// The digest covers the parent ID, the deletion flag and the canonical
    /// body, so replicas making the same edit arrive at the same ID.
    pub fn compute(parent: Option<&RevId>, deleted: bool, canonical_body: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([0u8, u8::from(deleted)]);
        hasher.update(canonical_body);
        let hash = hasher.finalize();

        let mut digest = String::with_capacity(DIGEST_HEX_LEN);
        for byte in hash.iter().take(DIGEST_HEX_LEN / 2) {
            digest.push_str(&format!("{byte:02x}"));
        }

        Self {
            generation: parent.map_or(1, |p| p.generation + 1),
            digest,
        }
    }

    /// Returns the generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the digest part.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevId {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| CoreError::InvalidRevId(s.to_string()))?;
        let generation = generation
            .parse::<u64>()
            .map_err(|_| CoreError::InvalidRevId(s.to_string()))?;
        Self::new(generation, digest)
    }
}

impl TryFrom<String> for RevId {
    type Error = CoreError;

    fn try_from(s: String) -> CoreResult<Self> {
        s.parse()
    }
}

impl From<RevId> for String {
    fn from(rev: RevId) -> Self {
        rev.to_string()
    }
}
