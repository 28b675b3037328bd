//! Handlers for requests sent by the peer.

use super::{ChangeStream, Negotiated, Session, SessionStats};
use crate::dispatch::{DispatchTable, HandlerFuture};
use crate::error::{SessionError, SessionResult};
use crate::state::SessionState;
use docsync_core::{
    attachment_digest, CheckpointOwner, CoreError, DocBody, FeedOptions, RevId,
};
use docsync_protocol::{
    negotiate, ChangesAck, ChangesBatch, CheckpointReply, GetAttachment, GetCheckpoint,
    HandshakeRequest, HandshakeResponse, Message, Profile, ProtocolError, RevisionMessage,
    RevisionUnavailable, SetCheckpoint, SubscribeChanges, SubscribeResponse,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

const HANDSHAKE: &[SessionState] = &[SessionState::Handshake];
const IDLE: &[SessionState] = &[SessionState::Idle];

/// Builds the table used by every session.
pub(super) fn dispatch_table() -> DispatchTable<Session> {
    DispatchTable::new()
        .on(Profile::Handshake, HANDSHAKE, handshake)
        .on(Profile::SubscribeChanges, IDLE, subscribe_changes)
        .on(Profile::ChangesBatch, SessionState::ACTIVE, changes_batch)
        .on_detached(Profile::Revision, SessionState::ACTIVE, revision)
        .on(Profile::RevisionUnavailable, SessionState::ACTIVE, revision_unavailable)
        .on(Profile::GetAttachment, SessionState::ACTIVE, get_attachment)
        .on(Profile::SetCheckpoint, SessionState::ACTIVE, set_checkpoint)
        .on(Profile::GetCheckpoint, SessionState::ACTIVE, get_checkpoint)
}

fn handshake(session: Arc<Session>, msg: Message) -> HandlerFuture {
    Box::pin(async move { session.handle_handshake(msg) })
}

fn subscribe_changes(session: Arc<Session>, msg: Message) -> HandlerFuture {
    Box::pin(async move { session.handle_subscribe(msg).await })
}

fn changes_batch(session: Arc<Session>, msg: Message) -> HandlerFuture {
    Box::pin(async move { session.handle_changes_batch(msg) })
}

fn revision(session: Arc<Session>, msg: Message) -> HandlerFuture {
    Box::pin(async move { session.handle_revision(msg).await })
}

fn revision_unavailable(session: Arc<Session>, msg: Message) -> HandlerFuture {
    Box::pin(async move { session.handle_revision_unavailable(msg) })
}

fn get_attachment(session: Arc<Session>, msg: Message) -> HandlerFuture {
    Box::pin(async move { session.handle_get_attachment(msg) })
}

fn set_checkpoint(session: Arc<Session>, msg: Message) -> HandlerFuture {
    Box::pin(async move { session.handle_set_checkpoint(msg) })
}

fn get_checkpoint(session: Arc<Session>, msg: Message) -> HandlerFuture {
    Box::pin(async move { session.handle_get_checkpoint(msg) })
}

fn parse_rev(rev: &str) -> SessionResult<RevId> {
    rev.parse::<RevId>()
        .map_err(|_| ProtocolError::invalid("rev", rev).into())
}

impl Session {
    fn handle_handshake(&self, msg: Message) -> SessionResult<Option<Message>> {
        let request = HandshakeRequest::from_message(&msg)?;
        let version = negotiate(&request.protocols, &self.config.supported_versions).ok_or_else(
            || SessionError::UnsupportedVersion {
                offered: request.protocols.clone(),
            },
        )?;

        let collections = if version.has_collections() && !request.collections.is_empty() {
            request
                .collections
                .iter()
                .map(|name| self.db.collection(name))
                .collect::<Result<Vec<_>, CoreError>>()?
        } else {
            vec![self.db.default_collection()?]
        };

        *self.negotiated.lock() = Some(Negotiated {
            version,
            collections,
        });
        self.transition(SessionState::Idle)?;
        info!(protocol = %version, "handshake complete");
        Ok(Some(HandshakeResponse { protocol: version }.to_response(&msg)))
    }

    async fn handle_subscribe(self: &Arc<Self>, msg: Message) -> SessionResult<Option<Message>> {
        let sub = SubscribeChanges::from_message(&msg)?;
        let (index, collection) = self.collection_for(&msg)?;
        let user = self.user.name();

        let stored = match &sub.client {
            Some(client) => collection
                .checkpoints()
                .get(CheckpointOwner::Server, user, client)?,
            None => None,
        };
        let mut since = sub
            .since
            .or_else(|| stored.as_ref().map(|c| c.last_sequence))
            .unwrap_or(0);
        let last = collection.last_sequence()?;
        let reset = since > last;
        if reset {
            warn!(since, last, "subscription is ahead of the collection; restarting from zero");
            since = 0;
        }

        let mut options = FeedOptions::since(since);
        if !sub.channels.is_empty() {
            options = options.with_channels(sub.channels.iter().cloned());
        }
        if !sub.doc_ids.is_empty() {
            options = options.with_doc_ids(sub.doc_ids.iter().cloned());
        }
        let feed = collection.changes(self.user.clone(), options);
        let batch_size = sub
            .batch_size
            .map_or(self.config.batch_size, |b| b.min(self.config.batch_size));

        self.transition(SessionState::Streaming)?;
        self.stats
            .acknowledged_sequence
            .fetch_max(since, std::sync::atomic::Ordering::Relaxed);
        info!(
            collection = %collection.name(),
            since,
            continuous = sub.continuous,
            channels = ?feed.channels(),
            "subscribed"
        );

        let stream = Arc::new(ChangeStream::new(
            index,
            collection,
            sub.client.clone(),
            since,
            stored.map(|c| c.rev),
        ));
        // The reply must precede the first batch.
        let reply = SubscribeResponse { since, reset }.to_response(&msg);
        self.out.send(&reply).await?;
        self.start_stream(stream, feed, batch_size, sub.continuous);
        Ok(None)
    }

    fn handle_changes_batch(&self, msg: Message) -> SessionResult<Option<Message>> {
        let batch = ChangesBatch::from_message(&msg)?;
        let (_, collection) = self.collection_for(&msg)?;
        let mut wanted = Vec::with_capacity(batch.rows.len());
        for row in &batch.rows {
            let rev = parse_rev(&row.rev)?;
            let missing = collection.missing_revs(&row.doc_id, &[rev])?;
            wanted.push(missing.iter().map(ToString::to_string).collect());
        }
        debug!(rows = batch.rows.len(), "peer proposed changes");
        Ok(Some(ChangesAck { wanted }.to_response(&msg)?))
    }

    async fn handle_revision(&self, msg: Message) -> SessionResult<Option<Message>> {
        let rev = RevisionMessage::from_message(&msg)?;
        let (index, collection) = self.collection_for(&msg)?;
        let body = DocBody::from_json(&rev.body)?;

        for meta in body.attachments.values() {
            if collection.has_attachment(&meta.digest)? {
                continue;
            }
            let request = GetAttachment {
                digest: meta.digest.clone(),
                doc_id: Some(rev.doc_id.clone()),
            }
            .to_message()
            .with_collection(self.collection_qualifier(index));
            let reply = self.request(request).await?;
            if attachment_digest(&reply.body) != meta.digest {
                return Err(ProtocolError::InvalidBody(format!(
                    "attachment data does not match digest {}",
                    meta.digest
                ))
                .into());
            }
            collection.put_attachment(&reply.body)?;
        }

        let history = rev
            .full_history()
            .iter()
            .map(|r| parse_rev(r))
            .collect::<SessionResult<Vec<_>>>()?;
        // The write loop backs off with a blocking sleep on CAS contention.
        let result = {
            let doc_id = rev.doc_id.clone();
            let deleted = rev.deleted;
            tokio::task::spawn_blocking(move || {
                collection.put_existing(&doc_id, &history, body, deleted, None)
            })
            .await
            .map_err(|e| SessionError::Internal(format!("revision write task failed: {e}")))??
        };
        SessionStats::bump(&self.stats.revisions_received);
        debug!(
            doc_id = %rev.doc_id,
            rev = %rev.rev,
            sequence = result.sequence,
            inserted = result.inserted,
            "stored pushed revision"
        );
        Ok(Some(Message::response_to(&msg)))
    }

    fn handle_revision_unavailable(&self, msg: Message) -> SessionResult<Option<Message>> {
        let norev = RevisionUnavailable::from_message(&msg)?;
        SessionStats::bump(&self.stats.norevs_received);
        info!(
            doc_id = %norev.doc_id,
            rev = %norev.rev,
            reason = %norev.reason,
            status = norev.status,
            "peer cannot supply revision"
        );
        Ok((!msg.no_reply).then(|| Message::response_to(&msg)))
    }

    fn handle_get_attachment(&self, msg: Message) -> SessionResult<Option<Message>> {
        let negotiated = self.negotiated()?;
        let request = GetAttachment::from_message(&msg, negotiated.version)?;
        let (index, collection) = self.collection_for(&msg)?;

        let advertised = self
            .advertised
            .lock()
            .contains(&(index, request.digest.clone()));
        if !advertised {
            return Err(SessionError::Forbidden(format!(
                "attachment {} was not offered to this session",
                request.digest
            )));
        }
        if negotiated.version.attachment_requires_doc_id() {
            let doc_id = request.doc_id.as_deref().unwrap_or_default();
            if !collection.doc_references_attachment(doc_id, &request.digest)? {
                return Err(SessionError::Forbidden(format!(
                    "document {doc_id} does not reference attachment {}",
                    request.digest
                )));
            }
        }

        let data = collection
            .get_attachment(&request.digest)?
            .ok_or_else(|| CoreError::NotFound {
                doc_id: request.digest.clone(),
            })?;
        Ok(Some(Message::response_to(&msg).with_body(data)))
    }

    fn handle_set_checkpoint(&self, msg: Message) -> SessionResult<Option<Message>> {
        let request = SetCheckpoint::from_message(&msg)?;
        let (_, collection) = self.collection_for(&msg)?;
        let rev = collection.checkpoints().set(
            CheckpointOwner::Peer,
            self.user.name(),
            &request.client,
            request.rev.as_deref(),
            request.sequence,
            request.body.to_vec(),
        )?;
        Ok(Some(SetCheckpoint::response(&msg, &rev)))
    }

    fn handle_get_checkpoint(&self, msg: Message) -> SessionResult<Option<Message>> {
        let request = GetCheckpoint::from_message(&msg)?;
        let (_, collection) = self.collection_for(&msg)?;
        let checkpoint = collection
            .checkpoints()
            .get(CheckpointOwner::Peer, self.user.name(), &request.client)?
            .ok_or_else(|| CoreError::NotFound {
                doc_id: request.client.clone(),
            })?;
        let reply = CheckpointReply {
            rev: checkpoint.rev,
            sequence: checkpoint.last_sequence,
            body: checkpoint.body.into(),
        };
        Ok(Some(reply.to_response(&msg)))
    }
}
