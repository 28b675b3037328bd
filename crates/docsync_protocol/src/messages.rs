//! Typed request and response messages.
//!
//! Each type converts to and from a [`Message`]. Collection qualifiers
//! are added by the caller with [`Message::with_collection`] because they
//! depend on the negotiated version, not on the message itself.

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{Message, MessageKind};
use crate::profile::Profile;
use crate::version::ProtocolVersion;
use bytes::Bytes;
use serde_json::Value;

/// Property names.
pub mod props {
    /// Offered versions, comma separated, preferred first.
    pub const PROTOCOLS: &str = "protocols";
    /// Chosen version.
    pub const PROTOCOL: &str = "protocol";
    /// Starting sequence.
    pub const SINCE: &str = "since";
    /// Continuous subscription flag.
    pub const CONTINUOUS: &str = "continuous";
    /// Requested batch size.
    pub const BATCH: &str = "batch";
    /// Channel filter, comma separated.
    pub const CHANNELS: &str = "channels";
    /// Document ID filter, comma separated.
    pub const DOC_IDS: &str = "docIDs";
    /// Replicator identity.
    pub const CLIENT: &str = "client";
    /// Subscription restarted from zero.
    pub const RESET: &str = "reset";
    /// Document ID.
    pub const ID: &str = "id";
    /// Revision ID.
    pub const REV: &str = "rev";
    /// Revision history, comma separated, newest first.
    pub const HISTORY: &str = "history";
    /// Tombstone flag.
    pub const DELETED: &str = "deleted";
    /// Sequence of a revision.
    pub const SEQUENCE: &str = "sequence";
    /// Unavailability reason.
    pub const REASON: &str = "reason";
    /// HTTP-style status.
    pub const STATUS: &str = "status";
    /// Attachment digest.
    pub const DIGEST: &str = "digest";
    /// Document ID on attachment requests.
    pub const DOC_ID: &str = "docID";
}

const FLAG_DELETED: u64 = 0b01;
const FLAG_REMOVED: u64 = 0b10;

fn expect_profile(msg: &Message, profile: Profile) -> ProtocolResult<()> {
    match msg.profile.as_deref() {
        Some(p) if p == profile.as_str() => Ok(()),
        other => Err(ProtocolError::UnexpectedProfile {
            expected: profile.as_str(),
            actual: other.unwrap_or("<none>").to_string(),
        }),
    }
}

fn expect_response(msg: &Message) -> ProtocolResult<()> {
    if msg.kind == MessageKind::Response {
        Ok(())
    } else {
        Err(ProtocolError::InvalidBody("expected a response".into()))
    }
}

fn join_list(name: &str, items: &[String]) -> ProtocolResult<String> {
    if let Some(bad) = items.iter().find(|i| i.is_empty() || i.contains(',')) {
        return Err(ProtocolError::invalid(name, bad));
    }
    Ok(items.join(","))
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_json(body: &[u8]) -> ProtocolResult<Option<Value>> {
    if body.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ProtocolError::InvalidBody(e.to_string()))
}

fn to_json(value: &Value) -> ProtocolResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::Encoding(e.to_string()))
}

/// Opening request of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Offered versions, preferred first. Unknown names are kept so the
    /// server can report them.
    pub protocols: Vec<String>,
    /// Collections the peer wants to replicate, addressed later by index.
    pub collections: Vec<String>,
}

impl HandshakeRequest {
    /// Offers the given versions.
    pub fn new(versions: &[ProtocolVersion]) -> Self {
        Self {
            protocols: versions.iter().map(|v| v.as_str().to_string()).collect(),
            collections: Vec::new(),
        }
    }

    /// Requests collections.
    #[must_use]
    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }

    /// Offered versions that this build knows, in the peer's order.
    pub fn known_versions(&self) -> Vec<ProtocolVersion> {
        self.protocols
            .iter()
            .filter_map(|p| ProtocolVersion::parse(p))
            .collect()
    }

    /// Builds the request message. Collections travel as a JSON array body.
    pub fn to_message(&self) -> ProtocolResult<Message> {
        let mut msg = Message::request(Profile::Handshake)
            .with_property(props::PROTOCOLS, join_list(props::PROTOCOLS, &self.protocols)?);
        if !self.collections.is_empty() {
            msg.body = to_json(&Value::from(self.collections.clone()))?;
        }
        Ok(msg)
    }

    /// Parses the request message.
    pub fn from_message(msg: &Message) -> ProtocolResult<Self> {
        expect_profile(msg, Profile::Handshake)?;
        let protocols = split_list(Some(msg.require(props::PROTOCOLS)?));
        let collections = match parse_json(&msg.body)? {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s),
                    other => Err(ProtocolError::InvalidBody(format!(
                        "collection name must be a string, got {other}"
                    ))),
                })
                .collect::<ProtocolResult<_>>()?,
            Some(other) => {
                return Err(ProtocolError::InvalidBody(format!(
                    "collections must be an array, got {other}"
                )))
            }
        };
        Ok(Self {
            protocols,
            collections,
        })
    }
}

/// Reply to a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Chosen version.
    pub protocol: ProtocolVersion,
}

impl HandshakeResponse {
    /// Builds the reply.
    pub fn to_response(&self, request: &Message) -> Message {
        Message::response_to(request).with_property(props::PROTOCOL, self.protocol.as_str())
    }

    /// Parses the reply.
    pub fn from_response(msg: &Message) -> ProtocolResult<Self> {
        expect_response(msg)?;
        let raw = msg.require(props::PROTOCOL)?;
        let protocol =
            ProtocolVersion::parse(raw).ok_or_else(|| ProtocolError::invalid(props::PROTOCOL, raw))?;
        Ok(Self { protocol })
    }
}

/// Starts change delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeChanges {
    /// Start after this sequence. `None` means the stored checkpoint of
    /// `client`, or zero.
    pub since: Option<u64>,
    /// Keep streaming after catching up.
    pub continuous: bool,
    /// Rows per batch requested by the peer.
    pub batch_size: Option<usize>,
    /// Channel filter; empty means every granted channel.
    pub channels: Vec<String>,
    /// Document ID filter.
    pub doc_ids: Vec<String>,
    /// Replicator identity for server-side checkpoints.
    pub client: Option<String>,
}

impl SubscribeChanges {
    /// Builds the request message.
    pub fn to_message(&self) -> ProtocolResult<Message> {
        let mut msg = Message::request(Profile::SubscribeChanges);
        if let Some(since) = self.since {
            msg.set_property(props::SINCE, since.to_string());
        }
        if self.continuous {
            msg.set_property(props::CONTINUOUS, "true");
        }
        if let Some(batch) = self.batch_size {
            msg.set_property(props::BATCH, batch.to_string());
        }
        if !self.channels.is_empty() {
            msg.set_property(props::CHANNELS, join_list(props::CHANNELS, &self.channels)?);
        }
        if !self.doc_ids.is_empty() {
            msg.set_property(props::DOC_IDS, join_list(props::DOC_IDS, &self.doc_ids)?);
        }
        if let Some(client) = &self.client {
            msg.set_property(props::CLIENT, client.clone());
        }
        Ok(msg)
    }

    /// Parses the request message.
    pub fn from_message(msg: &Message) -> ProtocolResult<Self> {
        expect_profile(msg, Profile::SubscribeChanges)?;
        let batch_size = match msg.u64_property(props::BATCH)? {
            Some(0) => return Err(ProtocolError::invalid(props::BATCH, "0")),
            other => other.map(|b| b as usize),
        };
        Ok(Self {
            since: msg.u64_property(props::SINCE)?,
            continuous: msg.bool_property(props::CONTINUOUS),
            batch_size,
            channels: split_list(msg.property(props::CHANNELS)),
            doc_ids: split_list(msg.property(props::DOC_IDS)),
            client: msg.property(props::CLIENT).map(str::to_string),
        })
    }
}

/// Reply to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeResponse {
    /// Sequence the feed actually starts after.
    pub since: u64,
    /// The requested position was unusable and the feed restarted at zero.
    pub reset: bool,
}

impl SubscribeResponse {
    /// Builds the reply.
    pub fn to_response(&self, request: &Message) -> Message {
        let mut reply =
            Message::response_to(request).with_property(props::SINCE, self.since.to_string());
        if self.reset {
            reply.set_property(props::RESET, "true");
        }
        reply
    }

    /// Parses the reply.
    pub fn from_response(msg: &Message) -> ProtocolResult<Self> {
        expect_response(msg)?;
        Ok(Self {
            since: msg.u64_property(props::SINCE)?.unwrap_or(0),
            reset: msg.bool_property(props::RESET),
        })
    }
}

/// One change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRow {
    /// Sequence of the change.
    pub sequence: u64,
    /// Document ID.
    pub doc_id: String,
    /// Revision ID.
    pub rev: String,
    /// The revision is a tombstone.
    pub deleted: bool,
    /// The document left the channel; the peer should drop it.
    pub removed: bool,
}

impl ChangeRow {
    fn flags(&self) -> u64 {
        let mut flags = 0;
        if self.deleted {
            flags |= FLAG_DELETED;
        }
        if self.removed {
            flags |= FLAG_REMOVED;
        }
        flags
    }

    fn to_json(&self) -> Value {
        let mut row = vec![
            Value::from(self.sequence),
            Value::from(self.doc_id.clone()),
            Value::from(self.rev.clone()),
        ];
        let flags = self.flags();
        if flags != 0 {
            row.push(Value::from(flags));
        }
        Value::Array(row)
    }

    fn from_json(value: &Value) -> ProtocolResult<Self> {
        let bad = || ProtocolError::InvalidBody(format!("malformed change row: {value}"));
        let items = value.as_array().ok_or_else(bad)?;
        if !(3..=4).contains(&items.len()) {
            return Err(bad());
        }
        let sequence = items[0].as_u64().ok_or_else(bad)?;
        let doc_id = items[1].as_str().ok_or_else(bad)?.to_string();
        let rev = items[2].as_str().ok_or_else(bad)?.to_string();
        let flags = match items.get(3) {
            Some(f) => f.as_u64().ok_or_else(bad)?,
            None => 0,
        };
        Ok(Self {
            sequence,
            doc_id,
            rev,
            deleted: flags & FLAG_DELETED != 0,
            removed: flags & FLAG_REMOVED != 0,
        })
    }
}

/// A batch of change rows. An empty batch means "caught up".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangesBatch {
    /// Rows in sequence order.
    pub rows: Vec<ChangeRow>,
}

impl ChangesBatch {
    /// The caught-up sentinel.
    pub fn caught_up() -> Self {
        Self::default()
    }

    /// Whether this is the caught-up sentinel.
    pub fn is_caught_up(&self) -> bool {
        self.rows.is_empty()
    }

    /// Highest sequence in the batch.
    pub fn last_sequence(&self) -> Option<u64> {
        self.rows.last().map(|r| r.sequence)
    }

    /// Builds the request message.
    pub fn to_message(&self) -> ProtocolResult<Message> {
        let rows = Value::Array(self.rows.iter().map(ChangeRow::to_json).collect());
        Ok(Message::request(Profile::ChangesBatch).with_body(to_json(&rows)?))
    }

    /// Parses the request message.
    pub fn from_message(msg: &Message) -> ProtocolResult<Self> {
        expect_profile(msg, Profile::ChangesBatch)?;
        match parse_json(&msg.body)? {
            None | Some(Value::Null) => Ok(Self::caught_up()),
            Some(Value::Array(items)) => Ok(Self {
                rows: items
                    .iter()
                    .map(ChangeRow::from_json)
                    .collect::<ProtocolResult<_>>()?,
            }),
            Some(other) => Err(ProtocolError::InvalidBody(format!(
                "changes must be an array, got {other}"
            ))),
        }
    }
}

/// Reply to a [`ChangesBatch`]: per row, the revisions the peer wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangesAck {
    /// One entry per row, in row order. Empty means not wanted.
    pub wanted: Vec<Vec<String>>,
}

impl ChangesAck {
    /// Revisions wanted for the row at `index`.
    pub fn wanted_at(&self, index: usize) -> &[String] {
        self.wanted.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Builds the reply.
    pub fn to_response(&self, request: &Message) -> ProtocolResult<Message> {
        let body = Value::Array(
            self.wanted
                .iter()
                .map(|revs| {
                    if revs.is_empty() {
                        Value::from(0)
                    } else {
                        Value::from(revs.clone())
                    }
                })
                .collect(),
        );
        Ok(Message::response_to(request).with_body(to_json(&body)?))
    }

    /// Parses the reply. Missing trailing entries mean "not wanted".
    pub fn from_response(msg: &Message) -> ProtocolResult<Self> {
        expect_response(msg)?;
        let items = match parse_json(&msg.body)? {
            None | Some(Value::Null) => return Ok(Self::default()),
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(ProtocolError::InvalidBody(format!(
                    "ack must be an array, got {other}"
                )))
            }
        };
        let wanted = items
            .into_iter()
            .map(|item| match item {
                Value::Array(revs) => revs
                    .into_iter()
                    .map(|r| match r {
                        Value::String(s) => Ok(s),
                        other => Err(ProtocolError::InvalidBody(format!(
                            "rev must be a string, got {other}"
                        ))),
                    })
                    .collect(),
                Value::Number(_) | Value::Null | Value::Bool(false) => Ok(Vec::new()),
                other => Err(ProtocolError::InvalidBody(format!(
                    "malformed ack entry: {other}"
                ))),
            })
            .collect::<ProtocolResult<_>>()?;
        Ok(Self { wanted })
    }
}

/// A revision with enough history for the receiver to link it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionMessage {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID.
    pub rev: String,
    /// Ancestors, newest first, excluding `rev`.
    pub history: Vec<String>,
    /// Tombstone flag.
    pub deleted: bool,
    /// Sequence on the sender, when known.
    pub sequence: Option<u64>,
    /// JSON body.
    pub body: Bytes,
}

impl RevisionMessage {
    /// Builds the request message.
    pub fn to_message(&self) -> ProtocolResult<Message> {
        let mut msg = Message::request(Profile::Revision)
            .with_property(props::ID, self.doc_id.clone())
            .with_property(props::REV, self.rev.clone())
            .with_body(self.body.clone());
        if !self.history.is_empty() {
            msg.set_property(props::HISTORY, join_list(props::HISTORY, &self.history)?);
        }
        if self.deleted {
            msg.set_property(props::DELETED, "true");
        }
        if let Some(seq) = self.sequence {
            msg.set_property(props::SEQUENCE, seq.to_string());
        }
        Ok(msg)
    }

    /// Parses the request message.
    pub fn from_message(msg: &Message) -> ProtocolResult<Self> {
        expect_profile(msg, Profile::Revision)?;
        Ok(Self {
            doc_id: msg.require(props::ID)?.to_string(),
            rev: msg.require(props::REV)?.to_string(),
            history: split_list(msg.property(props::HISTORY)),
            deleted: msg.bool_property(props::DELETED),
            sequence: msg.u64_property(props::SEQUENCE)?,
            body: msg.body.clone(),
        })
    }

    /// Full history including `rev`, newest first.
    pub fn full_history(&self) -> Vec<String> {
        std::iter::once(self.rev.clone())
            .chain(self.history.iter().cloned())
            .collect()
    }
}

/// A requested revision cannot be supplied. Terminal for that revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionUnavailable {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID.
    pub rev: String,
    /// Reason code (`missing`, `purged`, `pruned`, `corrupt`, `removed`).
    pub reason: String,
    /// HTTP-style status.
    pub status: u16,
}

impl RevisionUnavailable {
    /// Builds the request message.
    pub fn to_message(&self) -> Message {
        Message::request(Profile::RevisionUnavailable)
            .with_property(props::ID, self.doc_id.clone())
            .with_property(props::REV, self.rev.clone())
            .with_property(props::REASON, self.reason.clone())
            .with_property(props::STATUS, self.status.to_string())
            .no_reply(true)
    }

    /// Parses the request message.
    pub fn from_message(msg: &Message) -> ProtocolResult<Self> {
        expect_profile(msg, Profile::RevisionUnavailable)?;
        let status = match msg.property(props::STATUS) {
            Some(raw) => raw
                .parse()
                .map_err(|_| ProtocolError::invalid(props::STATUS, raw))?,
            None => 404,
        };
        Ok(Self {
            doc_id: msg.require(props::ID)?.to_string(),
            rev: msg.require(props::REV)?.to_string(),
            reason: msg.property(props::REASON).unwrap_or("missing").to_string(),
            status,
        })
    }
}

/// Fetches attachment bytes. The reply body is the raw data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetAttachment {
    /// Content digest.
    pub digest: String,
    /// Referencing document; required by versions that qualify attachments.
    pub doc_id: Option<String>,
}

impl GetAttachment {
    /// Builds the request message.
    pub fn to_message(&self) -> Message {
        let mut msg =
            Message::request(Profile::GetAttachment).with_property(props::DIGEST, self.digest.clone());
        if let Some(doc_id) = &self.doc_id {
            msg.set_property(props::DOC_ID, doc_id.clone());
        }
        msg
    }

    /// Parses the request message, enforcing the version's requirements.
    pub fn from_message(msg: &Message, version: ProtocolVersion) -> ProtocolResult<Self> {
        expect_profile(msg, Profile::GetAttachment)?;
        let doc_id = msg.property(props::DOC_ID).map(str::to_string);
        if version.attachment_requires_doc_id() && doc_id.is_none() {
            return Err(ProtocolError::MissingProperty(props::DOC_ID.into()));
        }
        Ok(Self {
            digest: msg.require(props::DIGEST)?.to_string(),
            doc_id,
        })
    }
}

/// Stores a checkpoint. `rev` must match the stored revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCheckpoint {
    /// Replicator identity.
    pub client: String,
    /// Revision of the checkpoint being replaced.
    pub rev: Option<String>,
    /// Last sequence the peer has fully processed.
    pub sequence: u64,
    /// Opaque state.
    pub body: Bytes,
}

impl SetCheckpoint {
    /// Builds the request message.
    pub fn to_message(&self) -> Message {
        let mut msg = Message::request(Profile::SetCheckpoint)
            .with_property(props::CLIENT, self.client.clone())
            .with_property(props::SEQUENCE, self.sequence.to_string())
            .with_body(self.body.clone());
        if let Some(rev) = &self.rev {
            msg.set_property(props::REV, rev.clone());
        }
        msg
    }

    /// Parses the request message.
    pub fn from_message(msg: &Message) -> ProtocolResult<Self> {
        expect_profile(msg, Profile::SetCheckpoint)?;
        Ok(Self {
            client: msg.require(props::CLIENT)?.to_string(),
            rev: msg.property(props::REV).map(str::to_string),
            sequence: msg.u64_property(props::SEQUENCE)?.unwrap_or(0),
            body: msg.body.clone(),
        })
    }

    /// Reply carrying the new checkpoint revision.
    pub fn response(request: &Message, rev: &str) -> Message {
        Message::response_to(request).with_property(props::REV, rev)
    }
}

/// Loads a checkpoint. The reply carries `rev` and the opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetCheckpoint {
    /// Replicator identity.
    pub client: String,
}

impl GetCheckpoint {
    /// Builds the request message.
    pub fn to_message(&self) -> Message {
        Message::request(Profile::GetCheckpoint).with_property(props::CLIENT, self.client.clone())
    }

    /// Parses the request message.
    pub fn from_message(msg: &Message) -> ProtocolResult<Self> {
        expect_profile(msg, Profile::GetCheckpoint)?;
        Ok(Self {
            client: msg.require(props::CLIENT)?.to_string(),
        })
    }
}

/// A stored checkpoint as returned by `get-checkpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointReply {
    /// Checkpoint revision.
    pub rev: String,
    /// Last sequence the peer recorded.
    pub sequence: u64,
    /// Opaque state.
    pub body: Bytes,
}

impl CheckpointReply {
    /// Builds the reply.
    pub fn to_response(&self, request: &Message) -> Message {
        Message::response_to(request)
            .with_property(props::REV, self.rev.clone())
            .with_property(props::SEQUENCE, self.sequence.to_string())
            .with_body(self.body.clone())
    }

    /// Parses the reply.
    pub fn from_response(msg: &Message) -> ProtocolResult<Self> {
        expect_response(msg)?;
        Ok(Self {
            rev: msg.require(props::REV)?.to_string(),
            sequence: msg.u64_property(props::SEQUENCE)?.unwrap_or(0),
            body: msg.body.clone(),
        })
    }
}
