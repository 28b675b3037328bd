//! Message profiles.

use std::fmt;

/// The kind of request a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Profile {
    /// Version negotiation; the first request of a session.
    Handshake,
    /// Starts change delivery from a sequence.
    SubscribeChanges,
    /// A batch of change rows. The reply lists the wanted revisions.
    ChangesBatch,
    /// A revision body with its history.
    Revision,
    /// A requested revision cannot be supplied.
    RevisionUnavailable,
    /// Fetches attachment bytes by digest.
    GetAttachment,
    /// Stores a checkpoint.
    SetCheckpoint,
    /// Loads a checkpoint.
    GetCheckpoint,
}

impl Profile {
    /// Every profile.
    pub const ALL: [Profile; 8] = [
        Profile::Handshake,
        Profile::SubscribeChanges,
        Profile::ChangesBatch,
        Profile::Revision,
        Profile::RevisionUnavailable,
        Profile::GetAttachment,
        Profile::SetCheckpoint,
        Profile::GetCheckpoint,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Handshake => "handshake",
            Profile::SubscribeChanges => "subscribe-changes",
            Profile::ChangesBatch => "changes-batch",
            Profile::Revision => "revision",
            Profile::RevisionUnavailable => "revision-unavailable",
            Profile::GetAttachment => "get-attachment",
            Profile::SetCheckpoint => "set-checkpoint",
            Profile::GetCheckpoint => "get-checkpoint",
        }
    }

    /// Parses a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }

    /// Whether the profile is qualified by a collection index in
    /// versions that have collections.
    pub fn is_collection_scoped(&self) -> bool {
        !matches!(self, Profile::Handshake)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
