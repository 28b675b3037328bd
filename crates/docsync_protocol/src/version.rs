//! Protocol versions and negotiation.

use std::fmt;

/// A protocol version the engine can speak.
///
/// Versions differ in whether a collection qualifier accompanies every
/// message after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    /// Single implicit collection.
    V2,
    /// Every request carries a `collection` index; attachment requests
    /// also carry the document ID.
    V3,
}

impl ProtocolVersion {
    /// All versions, newest first.
    pub const ALL: [ProtocolVersion; 2] = [ProtocolVersion::V3, ProtocolVersion::V2];

    /// Wire name of the version.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V2 => "docsync-2",
            ProtocolVersion::V3 => "docsync-3",
        }
    }

    /// Parses a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "docsync-2" => Some(ProtocolVersion::V2),
            "docsync-3" => Some(ProtocolVersion::V3),
            _ => None,
        }
    }

    /// Whether messages carry a collection qualifier.
    pub fn has_collections(&self) -> bool {
        matches!(self, ProtocolVersion::V3)
    }

    /// Whether attachment requests are qualified by document ID.
    pub fn attachment_requires_doc_id(&self) -> bool {
        matches!(self, ProtocolVersion::V3)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks the first version in the peer's preference order that is also
/// supported locally.
pub fn negotiate<S: AsRef<str>>(
    offered: &[S],
    supported: &[ProtocolVersion],
) -> Option<ProtocolVersion> {
    offered
        .iter()
        .filter_map(|s| ProtocolVersion::parse(s.as_ref()))
        .find(|v| supported.contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        for v in ProtocolVersion::ALL {
            assert_eq!(ProtocolVersion::parse(v.as_str()), Some(v));
        }
        assert_eq!(ProtocolVersion::parse("docsync-1"), None);
    }

    #[test]
    fn negotiation_follows_peer_preference() {
        let both = [ProtocolVersion::V2, ProtocolVersion::V3];
        assert_eq!(
            negotiate(&["docsync-3", "docsync-2"], &both),
            Some(ProtocolVersion::V3)
        );
        assert_eq!(
            negotiate(&["docsync-2", "docsync-3"], &both),
            Some(ProtocolVersion::V2)
        );
        assert_eq!(
            negotiate(&["docsync-3"], &[ProtocolVersion::V2]),
            None
        );
        assert_eq!(negotiate(&["bogus", "docsync-2"], &both), Some(ProtocolVersion::V2));
    }

    #[test]
    fn features() {
        assert!(ProtocolVersion::V3.has_collections());
        assert!(!ProtocolVersion::V2.has_collections());
        assert!(ProtocolVersion::V3.attachment_requires_doc_id());
    }
}
