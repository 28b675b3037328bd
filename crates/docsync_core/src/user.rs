//! Channel grants and channel assignment.
//!
//! Grant computation itself is external; these types only carry its
//! result and answer capability checks.

use crate::cache::STAR_CHANNEL;
use crate::document::DocBody;
use std::collections::BTreeSet;

/// The identity a session acts for, with its channel grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    name: String,
    channels: BTreeSet<String>,
}

impl UserContext {
    /// Creates a user with explicit channel grants.
    pub fn new<I, S>(name: impl Into<String>, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            channels: channels.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates a user granted every channel.
    pub fn admin(name: impl Into<String>) -> Self {
        Self::new(name, [STAR_CHANNEL])
    }

    /// Returns the user name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the granted channels.
    pub fn channels(&self) -> &BTreeSet<String> {
        &self.channels
    }

    /// Returns true if the user may see every channel.
    pub fn has_star(&self) -> bool {
        self.channels.contains(STAR_CHANNEL)
    }

    /// Returns true if the user may read `channel`.
    pub fn can_see(&self, channel: &str) -> bool {
        self.has_star() || self.channels.contains(channel)
    }

    /// Returns true if any of `channels` is visible.
    pub fn can_see_any(&self, channels: &BTreeSet<String>) -> bool {
        self.has_star() || !self.channels.is_disjoint(channels)
    }
}

/// Decides which channels a revision belongs to.
pub trait ChannelMapper: Send + Sync {
    /// Returns the channels for a document body.
    fn channels_for(&self, doc_id: &str, body: &DocBody) -> BTreeSet<String>;
}

/// Reads the `channels` property of the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyChannelMapper;

impl ChannelMapper for PropertyChannelMapper {
    fn channels_for(&self, _doc_id: &str, body: &DocBody) -> BTreeSet<String> {
        body.channel_property()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants() {
        let user = UserContext::new("alice", ["A", "B"]);
        assert!(user.can_see("A"));
        assert!(!user.can_see("C"));
        assert!(!user.has_star());
        assert!(user.can_see_any(&BTreeSet::from(["C".to_string(), "B".to_string()])));

        let admin = UserContext::admin("root");
        assert!(admin.can_see("anything"));
    }

    #[test]
    fn property_mapper() {
        let body = DocBody::new().with("channels", serde_json::json!(["x", "y"]));
        let chans = PropertyChannelMapper.channels_for("d", &body);
        assert_eq!(chans.len(), 2);
    }
}
