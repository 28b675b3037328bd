//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use docsync_core::RevId;
use docsync_protocol::{ChangeRow, Message, MessageKind, Profile};
use proptest::prelude::*;
use serde_json::Value;

/// Strategy for generating document IDs.
pub fn doc_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9][a-zA-Z0-9_:.]{0,23}").expect("Invalid regex")
}

/// Strategy for generating channel names.
pub fn channel_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,11}").expect("Invalid regex")
}

/// Strategy for generating well-formed revision IDs.
pub fn rev_id_strategy() -> impl Strategy<Value = RevId> {
    (1u64..1000, prop::string::string_regex("[0-9a-f]{32}").expect("Invalid regex"))
        .prop_map(|(generation, digest)| {
            RevId::new(generation, digest).expect("generated rev id is valid")
        })
}

/// Strategy for flat JSON document bodies with an optional channel list.
pub fn doc_json_strategy() -> impl Strategy<Value = Value> {
    (
        prop::collection::btree_map(
            prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"),
            prop_oneof![
                any::<i64>().prop_map(Value::from),
                any::<bool>().prop_map(Value::from),
                prop::string::string_regex("[ -~]{0,16}")
                    .expect("Invalid regex")
                    .prop_map(Value::from),
            ],
            0..6,
        ),
        prop::collection::vec(channel_strategy(), 0..3),
    )
        .prop_map(|(props, channels)| {
            let mut map: serde_json::Map<String, Value> = props.into_iter().collect();
            if !channels.is_empty() {
                map.insert("channels".into(), Value::from(channels));
            }
            Value::Object(map)
        })
}

/// Strategy for change rows with strictly increasing sequences.
pub fn change_rows_strategy(max: usize) -> impl Strategy<Value = Vec<ChangeRow>> {
    prop::collection::vec(
        (1u64..50, doc_id_strategy(), rev_id_strategy(), any::<bool>(), any::<bool>()),
        0..max,
    )
    .prop_map(|items| {
        let mut sequence = 0;
        items
            .into_iter()
            .map(|(step, doc_id, rev, deleted, removed)| {
                sequence += step;
                ChangeRow {
                    sequence,
                    doc_id,
                    rev: rev.to_string(),
                    deleted,
                    removed,
                }
            })
            .collect()
    })
}

/// Strategy for arbitrary frames, requests and replies alike.
pub fn message_strategy() -> impl Strategy<Value = Message> {
    (
        any::<u64>(),
        prop::sample::select(Profile::ALL.to_vec()),
        prop_oneof![
            Just(MessageKind::Request),
            Just(MessageKind::Response),
            Just(MessageKind::Error)
        ],
        prop::collection::btree_map(
            prop::string::string_regex("[A-Za-z][A-Za-z-]{0,11}").expect("Invalid regex"),
            prop::string::string_regex("[ -~]{0,24}").expect("Invalid regex"),
            0..5,
        ),
        prop::collection::vec(any::<u8>(), 0..512),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(serial, profile, kind, properties, body, compressed, no_reply)| {
            let mut msg = Message::request(profile);
            msg.serial = serial;
            msg.kind = kind;
            if kind != MessageKind::Request {
                msg.profile = None;
            }
            msg.properties = properties;
            msg.body = body.into();
            msg.compressed = compressed && !msg.body.is_empty();
            msg.no_reply = no_reply;
            msg
        })
}
