//! Message exchanges as a session sees them on the wire.

use bytes::Bytes;
use docsync_protocol::messages::props;
use docsync_protocol::{
    negotiate, ChangeRow, ChangesAck, ChangesBatch, HandshakeRequest, HandshakeResponse, Message,
    MessageKind, Profile, ProtocolVersion, RevisionMessage, PROP_COLLECTION,
};
use proptest::prelude::*;

fn wire(msg: &Message) -> Message {
    Message::decode(&msg.encode(3).unwrap()).unwrap()
}

#[test]
fn handshake_then_batch_in_collection() {
    let mut hello = HandshakeRequest::new(&[ProtocolVersion::V3, ProtocolVersion::V2])
        .with_collections(["_default", "orders"])
        .to_message()
        .unwrap();
    hello.serial = 1;
    let hello = wire(&hello);

    let parsed = HandshakeRequest::from_message(&hello).unwrap();
    let chosen = negotiate(&parsed.protocols, &[ProtocolVersion::V2, ProtocolVersion::V3]).unwrap();
    assert_eq!(chosen, ProtocolVersion::V3);

    let reply = wire(&HandshakeResponse { protocol: chosen }.to_response(&hello));
    assert_eq!(reply.serial, 1);
    assert_eq!(reply.kind, MessageKind::Response);
    assert_eq!(HandshakeResponse::from_response(&reply).unwrap().protocol, chosen);

    let mut batch = ChangesBatch {
        rows: vec![ChangeRow {
            sequence: 7,
            doc_id: "o1".into(),
            rev: "1-ab".into(),
            deleted: false,
            removed: false,
        }],
    }
    .to_message()
    .unwrap()
    .with_collection(Some(1));
    batch.serial = 2;
    let batch = wire(&batch);
    assert_eq!(batch.property(PROP_COLLECTION), Some("1"));
    assert_eq!(batch.known_profile().unwrap(), Profile::ChangesBatch);

    let ack = ChangesAck {
        wanted: vec![vec!["1-ab".into()]],
    };
    let ack_reply = wire(&ack.to_response(&batch).unwrap());
    assert_eq!(ack_reply.serial, 2);
    assert_eq!(ChangesAck::from_response(&ack_reply).unwrap(), ack);
}

#[test]
fn compressed_revision_survives_the_wire() {
    let body = serde_json::to_vec(&serde_json::json!({
        "title": "x".repeat(2000),
        "tags": ["a", "b"],
    }))
    .unwrap();
    let rev = RevisionMessage {
        doc_id: "doc".into(),
        rev: "2-bb".into(),
        history: vec!["1-aa".into()],
        deleted: false,
        sequence: Some(4),
        body: Bytes::from(body.clone()),
    };
    let msg = rev.to_message().unwrap().compressed(true);
    let frame = msg.encode(3).unwrap();
    assert!(frame.len() < body.len());

    let parsed = RevisionMessage::from_message(&Message::decode(&frame).unwrap()).unwrap();
    assert_eq!(parsed, rev);
}

#[test]
fn no_common_version() {
    let offered = vec!["docsync-1".to_string()];
    assert!(negotiate(&offered, &ProtocolVersion::ALL).is_none());

    let msg = Message::request(Profile::Handshake).with_property(props::PROTOCOLS, "docsync-1");
    assert!(HandshakeRequest::from_message(&msg)
        .unwrap()
        .known_versions()
        .is_empty());
}

proptest! {
    #[test]
    fn arbitrary_frames_decode_to_themselves(
        serial in any::<u64>(),
        props in prop::collection::btree_map("[a-zA-Z-]{1,12}", "[ -~]{0,24}", 0..6),
        body in prop::collection::vec(any::<u8>(), 0..512),
        compressed in any::<bool>(),
    ) {
        let mut msg = Message::request(Profile::Revision)
            .with_body(body)
            .compressed(compressed);
        msg.serial = serial;
        msg.properties = props;
        let decoded = Message::decode(&msg.encode(1).unwrap()).unwrap();
        prop_assert_eq!(decoded.serial, msg.serial);
        prop_assert_eq!(decoded.properties, msg.properties);
        prop_assert_eq!(decoded.body, msg.body);
    }
}
