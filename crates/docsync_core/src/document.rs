//! Document bodies and stored document records.

use crate::error::{CoreError, CoreResult};
use crate::revision::{RevId, RevTree};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Name of the body property the default channel mapper reads.
pub const CHANNELS_PROPERTY: &str = "channels";

/// Metadata for one attachment referenced from a document body.
///
/// Attachment bytes are never inlined in bodies; they are stored once
/// under their digest and fetched on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    /// Content digest, `sha256-<hex>`.
    pub digest: String,
    /// Length in bytes.
    pub length: u64,
    /// MIME type, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Generation of the revision that added the attachment.
    #[serde(default)]
    pub revpos: u64,
    /// Always true once stored; bodies carry stubs only.
    #[serde(default = "default_stub")]
    pub stub: bool,
}

fn default_stub() -> bool {
    true
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A document body: reserved underscore fields plus user properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocBody {
    /// Document ID, when present in the body.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Revision ID, when present in the body.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Deletion flag.
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    /// Attachments by name.
    #[serde(
        rename = "_attachments",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub attachments: BTreeMap<String, AttachmentMeta>,
    /// User-defined properties, ordered by name.
    #[serde(flatten)]
    pub properties: BTreeMap<String, Value>,
}

impl DocBody {
    /// Creates an empty body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a property, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Parses a body from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(bytes).map_err(CoreError::encoding)
    }

    /// Serializes the body as JSON.
    pub fn to_json(&self) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(CoreError::encoding)
    }

    /// Returns a property.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Canonical encoding used for revision digests and storage.
    ///
    /// Keys are sorted at every level, output is compact, and `_id` and
    /// `_rev` are left out.
    pub fn canonical_json(&self) -> CoreResult<String> {
        let mut stripped = self.clone();
        stripped.id = None;
        stripped.rev = None;
        let value = serde_json::to_value(&stripped).map_err(CoreError::encoding)?;
        serde_json::to_string(&value).map_err(CoreError::encoding)
    }

    /// Returns the channels named by the `channels` property.
    ///
    /// Accepts a single string or an array of strings.
    pub fn channel_property(&self) -> BTreeSet<String> {
        match self.properties.get(CHANNELS_PROPERTY) {
            Some(Value::String(s)) => BTreeSet::from([s.clone()]),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Returns true if any attachment has the given digest.
    pub fn references_digest(&self, digest: &str) -> bool {
        self.attachments.values().any(|a| a.digest == digest)
    }
}

/// Computes the content digest of attachment bytes.
pub fn attachment_digest(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    let mut hex = String::with_capacity(7 + hash.len() * 2);
    hex.push_str("sha256-");
    for byte in hash.iter() {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// The stored form of a document.
///
/// Records are written only through compare-and-swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Document ID.
    pub doc_id: String,
    /// Full revision tree.
    pub tree: RevTree,
    /// Current winning revision.
    pub current_rev: Option<RevId>,
    /// Sequence of the last write.
    pub sequence: u64,
    /// Whether the winning revision is deleted.
    pub deleted: bool,
    /// Channels of the winning revision. A tombstone stays in the
    /// channels it was deleted from so replicas learn of the deletion.
    pub channels: BTreeSet<String>,
    /// Channels the last write removed the document from.
    #[serde(default)]
    pub removed_channels: BTreeSet<String>,
    /// Every channel the document has ever been in.
    #[serde(default)]
    pub channel_history: BTreeSet<String>,
}

impl DocumentRecord {
    /// Creates a record with an empty tree.
    pub fn new(doc_id: impl Into<String>) -> Self {
        let doc_id = doc_id.into();
        Self {
            tree: RevTree::new(doc_id.clone()),
            doc_id,
            current_rev: None,
            sequence: 0,
            deleted: false,
            channels: BTreeSet::new(),
            removed_channels: BTreeSet::new(),
            channel_history: BTreeSet::new(),
        }
    }

    /// Recomputes the winner-derived fields after the tree changed.
    ///
    /// Returns the channels the document left.
    pub fn refresh_winner(&mut self) -> BTreeSet<String> {
        let (rev, deleted, channels) = match self.tree.winning_revision() {
            Some(w) => (Some(w.id.clone()), w.deleted, w.channels.clone()),
            None => (None, true, BTreeSet::new()),
        };
        let visible = channels;
        let removed: BTreeSet<String> = self.channels.difference(&visible).cloned().collect();

        self.current_rev = rev;
        self.deleted = deleted;
        self.channel_history.extend(visible.iter().cloned());
        self.channels = visible;
        self.removed_channels = removed.clone();
        removed
    }

    /// Returns the winning body, if it is retained.
    pub fn current_body(&self) -> Option<&str> {
        self.current_rev
            .as_ref()
            .and_then(|rev| self.tree.get(rev))
            .and_then(|info| info.body.as_deref())
    }

    /// Encodes the record as CBOR.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(CoreError::encoding)?;
        Ok(buf)
    }

    /// Decodes a record and checks its tree.
    pub fn decode(doc_id: &str, bytes: &[u8]) -> CoreResult<Self> {
        let record: Self =
            ciborium::from_reader(bytes).map_err(|e| CoreError::RevisionTreeCorrupt {
                doc_id: doc_id.to_string(),
                message: e.to_string(),
            })?;
        if record.doc_id != doc_id || record.tree.doc_id() != doc_id {
            return Err(CoreError::RevisionTreeCorrupt {
                doc_id: doc_id.to_string(),
                message: format!("record belongs to {}", record.doc_id),
            });
        }
        record.tree.validate()?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_keeps_reserved_and_user_fields_apart() {
        let raw = br#"{"_id":"d1","_rev":"1-a","_deleted":true,"name":"x","n":3}"#;
        let body = DocBody::from_json(raw).unwrap();
        assert_eq!(body.id.as_deref(), Some("d1"));
        assert_eq!(body.rev.as_deref(), Some("1-a"));
        assert!(body.deleted);
        assert_eq!(body.get("name"), Some(&json!("x")));
        assert!(!body.properties.contains_key("_id"));
    }

    #[test]
    fn canonical_json_is_sorted_and_strips_ids() {
        let a = DocBody::from_json(br#"{"_id":"d","b":1,"a":{"z":1,"y":2}}"#).unwrap();
        let b = DocBody::from_json(br#"{"a":{"y":2,"z":1},"b":1,"_rev":"9-q"}"#).unwrap();
        assert_eq!(a.canonical_json().unwrap(), r#"{"a":{"y":2,"z":1},"b":1}"#);
        assert_eq!(a.canonical_json().unwrap(), b.canonical_json().unwrap());
    }

    #[test]
    fn channel_property_forms() {
        let single = DocBody::new().with("channels", "ABC");
        assert_eq!(single.channel_property(), BTreeSet::from(["ABC".to_string()]));

        let many = DocBody::new().with("channels", json!(["a", "b", 3]));
        assert_eq!(many.channel_property().len(), 2);

        assert!(DocBody::new().channel_property().is_empty());
    }

    #[test]
    fn attachment_digest_format() {
        let d = attachment_digest(b"hello");
        assert!(d.starts_with("sha256-"));
        assert_eq!(d.len(), 7 + 64);
        assert_eq!(d, attachment_digest(b"hello"));
    }

    #[test]
    fn refresh_winner_reports_removed_channels() {
        let mut record = DocumentRecord::new("d");
        let r1: RevId = "1-a".parse().unwrap();
        record
            .tree
            .add_revision(None, r1.clone(), false, BTreeSet::from(["A".into(), "B".into()]))
            .unwrap();
        assert!(record.refresh_winner().is_empty());

        let r2: RevId = "2-b".parse().unwrap();
        record
            .tree
            .add_revision(Some(&r1), r2.clone(), false, BTreeSet::from(["B".into()]))
            .unwrap();
        let removed = record.refresh_winner();
        assert_eq!(removed, BTreeSet::from(["A".to_string()]));
        assert_eq!(record.current_rev, Some(r2));
        assert_eq!(record.channel_history.len(), 2);
    }

    #[test]
    fn record_roundtrip_and_corrupt_detection() {
        let mut record = DocumentRecord::new("d");
        record
            .tree
            .add_revision(None, "1-a".parse().unwrap(), false, BTreeSet::new())
            .unwrap();
        record.refresh_winner();
        let bytes = record.encode().unwrap();
        assert_eq!(DocumentRecord::decode("d", &bytes).unwrap(), record);

        assert!(matches!(
            DocumentRecord::decode("other", &bytes),
            Err(CoreError::RevisionTreeCorrupt { .. })
        ));
        assert!(matches!(
            DocumentRecord::decode("d", b"\xff\x00garbage"),
            Err(CoreError::RevisionTreeCorrupt { .. })
        ));
    }
}
