//! A scripted replication peer.
//!
//! [`TestPeer`] holds the far end of a session's transport and speaks the
//! wire protocol directly, so tests can observe and answer each frame the
//! session sends. Replies that arrive while a test is waiting for a
//! request are kept, and vice versa, so the two can interleave freely.

use crate::fixtures::TestDatabase;
use docsync_core::UserContext;
use docsync_protocol::{
    ChangeRow, ChangesAck, ChangesBatch, HandshakeRequest, HandshakeResponse, Message,
    MessageKind, Profile, ProtocolVersion, RevisionMessage, RevisionUnavailable,
    SubscribeChanges, SubscribeResponse, PROP_COLLECTION,
};
use docsync_server::{
    duplex_pair, spawn_session, FrameReceiver, FrameSender, SessionConfig, SessionHandle,
    Transport, DEFAULT_CAPACITY,
};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// How long the peer waits for any frame before failing the test.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything received during a one-shot pull.
#[derive(Debug, Default, Clone)]
pub struct Pulled {
    /// Rows of every non-empty batch, in arrival order.
    pub rows: Vec<ChangeRow>,
    /// Revisions received.
    pub revisions: Vec<RevisionMessage>,
    /// Revision-unavailable notices received.
    pub norevs: Vec<RevisionUnavailable>,
    /// Non-empty batches received.
    pub batches: usize,
}

impl Pulled {
    /// Sequence of the last row received, or 0.
    pub fn last_sequence(&self) -> u64 {
        self.rows.last().map_or(0, |r| r.sequence)
    }

    /// Document IDs of the received revisions, in arrival order.
    pub fn doc_ids(&self) -> Vec<String> {
        self.revisions.iter().map(|r| r.doc_id.clone()).collect()
    }

    /// The revision received for `doc_id`, if any.
    pub fn revision(&self, doc_id: &str) -> Option<&RevisionMessage> {
        self.revisions.iter().find(|r| r.doc_id == doc_id)
    }
}

/// The peer side of a replication connection.
pub struct TestPeer {
    tx: FrameSender,
    rx: FrameReceiver,
    next_serial: u64,
    inbox: VecDeque<Message>,
    replies: HashMap<u64, Message>,
    version: Option<ProtocolVersion>,
    collection: Option<usize>,
}

impl TestPeer {
    /// Wraps the peer end of a transport.
    pub fn new(transport: Transport) -> Self {
        let (tx, rx) = transport.split(0);
        Self {
            tx,
            rx,
            next_serial: 1,
            inbox: VecDeque::new(),
            replies: HashMap::new(),
            version: None,
            collection: None,
        }
    }

    /// Starts a session on `db` for `user` and connects a peer to it.
    pub fn connect(
        db: &TestDatabase,
        user: UserContext,
        config: SessionConfig,
    ) -> (Self, SessionHandle) {
        let (server_end, peer_end) = duplex_pair(DEFAULT_CAPACITY);
        let handle = spawn_session(db.db.clone(), user, server_end, config);
        (Self::new(peer_end), handle)
    }

    /// Version agreed at handshake.
    pub fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    /// Addresses later requests to the collection at `index`. Only
    /// meaningful after a collection-aware handshake.
    pub fn use_collection(&mut self, index: usize) {
        self.collection = Some(index);
    }

    /// Sends a request and returns its serial. Requests are qualified with
    /// the current collection unless they already name one.
    pub async fn send(&mut self, mut msg: Message) -> u64 {
        if msg.kind == MessageKind::Request {
            msg.serial = self.next_serial;
            self.next_serial += 1;
            if msg.property(PROP_COLLECTION).is_none() {
                msg = msg.with_collection(self.collection);
            }
        }
        self.tx.send(&msg).await.expect("session hung up");
        msg.serial
    }

    /// Sends a reply to one of the session's requests.
    pub async fn reply(&mut self, reply: Message) {
        self.tx.send(&reply).await.expect("session hung up");
    }

    /// Sends a request and waits for its reply.
    pub async fn request(&mut self, msg: Message) -> Message {
        let serial = self.send(msg).await;
        self.wait_reply(serial).await
    }

    /// Waits for the reply to `serial`.
    pub async fn wait_reply(&mut self, serial: u64) -> Message {
        if let Some(reply) = self.replies.remove(&serial) {
            return reply;
        }
        loop {
            let msg = self
                .recv(PEER_TIMEOUT)
                .await
                .unwrap_or_else(|| panic!("no reply to request {serial}"));
            match msg.kind {
                MessageKind::Request => self.inbox.push_back(msg),
                _ if msg.serial == serial => return msg,
                _ => {
                    self.replies.insert(msg.serial, msg);
                }
            }
        }
    }

    /// Waits for the next request from the session. `None` when the
    /// session hung up.
    pub async fn next_request(&mut self) -> Option<Message> {
        self.next_request_within(PEER_TIMEOUT).await
    }

    /// Like [`TestPeer::next_request`], but returns `None` if nothing
    /// arrives within `within` instead of failing.
    pub async fn try_next_request(&mut self, within: Duration) -> Option<Message> {
        if let Some(msg) = self.inbox.pop_front() {
            return Some(msg);
        }
        let deadline = Instant::now() + within;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.rx.recv())
                .await
                .ok()??
                .expect("undecodable frame from session");
            if msg.kind == MessageKind::Request {
                return Some(msg);
            }
            self.replies.insert(msg.serial, msg);
        }
    }

    async fn next_request_within(&mut self, within: Duration) -> Option<Message> {
        if let Some(msg) = self.inbox.pop_front() {
            return Some(msg);
        }
        loop {
            let msg = self.recv(within).await?;
            if msg.kind == MessageKind::Request {
                return Some(msg);
            }
            self.replies.insert(msg.serial, msg);
        }
    }

    /// Waits for a request with the given profile.
    pub async fn expect_request(&mut self, profile: Profile) -> Message {
        let msg = self
            .next_request()
            .await
            .unwrap_or_else(|| panic!("session hung up while waiting for {profile}"));
        assert_eq!(
            msg.profile.as_deref(),
            Some(profile.as_str()),
            "unexpected request {msg:?}"
        );
        msg
    }

    /// Returns true once the session has hung up. Pending frames are
    /// discarded.
    pub async fn wait_hang_up(&mut self) -> bool {
        self.inbox.clear();
        loop {
            match tokio::time::timeout(PEER_TIMEOUT, self.rx.recv()).await {
                Ok(None) => return true,
                Ok(Some(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    async fn recv(&mut self, within: Duration) -> Option<Message> {
        match tokio::time::timeout(within, self.rx.recv()).await {
            Ok(Some(frame)) => Some(frame.expect("undecodable frame from session")),
            Ok(None) => None,
            Err(_) => panic!("peer timed out after {within:?}"),
        }
    }

    /// Offers `versions` and asks for `collections`. Returns the raw reply,
    /// which is an error when negotiation fails.
    pub async fn handshake(
        &mut self,
        versions: &[ProtocolVersion],
        collections: &[&str],
    ) -> Message {
        let request = HandshakeRequest::new(versions)
            .with_collections(collections.iter().copied())
            .to_message()
            .expect("handshake encodes");
        let reply = self.request(request).await;
        if !reply.is_error() {
            let response = HandshakeResponse::from_response(&reply).expect("handshake reply");
            self.version = Some(response.protocol);
            self.collection = response.protocol.has_collections().then_some(0);
        }
        reply
    }

    /// Handshakes with every known version on the default collection.
    pub async fn handshake_default(&mut self) -> ProtocolVersion {
        let reply = self.handshake(&ProtocolVersion::ALL, &[]).await;
        assert!(!reply.is_error(), "handshake failed: {reply:?}");
        self.version.expect("version negotiated")
    }

    /// Subscribes to changes.
    pub async fn subscribe(&mut self, sub: &SubscribeChanges) -> SubscribeResponse {
        let reply = self
            .request(sub.to_message().expect("subscription encodes"))
            .await;
        assert!(!reply.is_error(), "subscription failed: {reply:?}");
        SubscribeResponse::from_response(&reply).expect("subscription reply")
    }

    /// Answers a changes batch asking for every row that is not a
    /// removal. Returns the parsed batch.
    pub async fn ack_all(&mut self, msg: &Message) -> ChangesBatch {
        let batch = ChangesBatch::from_message(msg).expect("changes batch");
        let wanted = batch
            .rows
            .iter()
            .map(|row| {
                if row.removed {
                    Vec::new()
                } else {
                    vec![row.rev.clone()]
                }
            })
            .collect();
        let reply = ChangesAck { wanted }
            .to_response(msg)
            .expect("ack encodes");
        self.reply(reply).await;
        batch
    }

    /// Subscribes and pulls until the caught-up batch.
    pub async fn pull(&mut self, sub: SubscribeChanges) -> Pulled {
        self.subscribe(&sub).await;
        self.pull_until_caught_up().await
    }

    /// Answers batches and revisions until the caught-up batch arrives.
    pub async fn pull_until_caught_up(&mut self) -> Pulled {
        let mut pulled = Pulled::default();
        loop {
            let msg = self
                .next_request()
                .await
                .expect("session hung up before catching up");
            match msg.known_profile().expect("known profile") {
                Profile::ChangesBatch => {
                    let batch = self.ack_all(&msg).await;
                    if batch.is_caught_up() {
                        return pulled;
                    }
                    pulled.batches += 1;
                    pulled.rows.extend(batch.rows);
                }
                Profile::Revision => {
                    let rev = RevisionMessage::from_message(&msg).expect("revision");
                    self.reply(Message::response_to(&msg)).await;
                    pulled.revisions.push(rev);
                }
                Profile::RevisionUnavailable => {
                    pulled
                        .norevs
                        .push(RevisionUnavailable::from_message(&msg).expect("norev"));
                }
                other => panic!("unexpected {other} during pull"),
            }
        }
    }
}

impl std::fmt::Debug for TestPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestPeer")
            .field("version", &self.version)
            .field("collection", &self.collection)
            .field("queued", &self.inbox.len())
            .finish_non_exhaustive()
    }
}
