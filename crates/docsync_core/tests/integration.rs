//! Integration tests for the document write path, change cache and feeds.

use docsync_core::{
    CacheConfig, CheckpointOwner, CoreError, Database, DatabaseConfig, DocBody, FeedEvent,
    FeedOptions, RetryConfig, RevId, UnavailableReason, UserContext, STAR_CHANNEL,
};
use docsync_store::{KvStore, MemoryIndex, MemoryStore, SecondaryIndex};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    store: Arc<MemoryStore>,
    index: Arc<MemoryIndex>,
    db: Database,
}

fn open(config: DatabaseConfig) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemoryIndex::new());
    let db = Database::open(config, store.clone(), index.clone()).unwrap();
    Fixture { store, index, db }
}

fn fixture() -> Fixture {
    open(DatabaseConfig::new("test").with_collection("hotels"))
}

fn body(channels: &[&str]) -> DocBody {
    DocBody::new().with("channels", json!(channels))
}

fn chans(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn unknown_collection_is_reported() {
    let f = fixture();
    assert_eq!(f.db.collection_names(), vec!["_default", "hotels"]);
    assert!(matches!(
        f.db.collection("nope"),
        Err(CoreError::CollectionNotFound { .. })
    ));
}

#[test]
fn put_creates_and_updates() {
    let f = fixture();
    let coll = f.db.default_collection().unwrap();

    let first = coll.put("doc1", None, body(&["A"]).with("v", 1), None).unwrap();
    assert!(first.inserted);
    assert_eq!(first.rev.generation(), 1);
    assert_eq!(first.sequence, 1);

    let second = coll
        .put("doc1", Some(&first.rev), body(&["A"]).with("v", 2), None)
        .unwrap();
    assert_eq!(second.rev.generation(), 2);
    assert_eq!(second.sequence, 2);

    let current = coll.get("doc1").unwrap();
    assert_eq!(current.get("v"), Some(&json!(2)));
    assert_eq!(current.rev.as_deref(), Some(second.rev.to_string().as_str()));
}

#[test]
fn identical_edits_converge() {
    let a = fixture();
    let b = fixture();
    let ra = a
        .db
        .default_collection()
        .unwrap()
        .put("d", None, body(&["A"]).with("x", 1), None)
        .unwrap();
    let rb = b
        .db
        .default_collection()
        .unwrap()
        .put("d", None, body(&["A"]).with("x", 1), None)
        .unwrap();
    assert_eq!(ra.rev, rb.rev);

    let again = a
        .db
        .default_collection()
        .unwrap()
        .put("d", None, body(&["A"]).with("x", 1), None);
    assert!(matches!(again, Err(CoreError::RevisionConflict { .. })));
}

#[test]
fn stale_parent_is_a_conflict_unless_allowed() {
    let f = fixture();
    let coll = f.db.default_collection().unwrap();
    let r1 = coll.put("d", None, body(&["A"]), None).unwrap().rev;
    coll.put("d", Some(&r1), body(&["A"]).with("n", 1), None)
        .unwrap();
    let err = coll
        .put("d", Some(&r1), body(&["A"]).with("n", 2), None)
        .unwrap_err();
    assert!(matches!(err, CoreError::RevisionConflict { .. }));

    let relaxed = open(DatabaseConfig::new("t").with_allow_conflicts(true));
    let coll = relaxed.db.default_collection().unwrap();
    let r1 = coll.put("d", None, body(&["A"]), None).unwrap().rev;
    coll.put("d", Some(&r1), body(&["A"]).with("n", 1), None)
        .unwrap();
    coll.put("d", Some(&r1), body(&["A"]).with("n", 2), None)
        .unwrap();
    assert_eq!(coll.leaves("d").unwrap().len(), 2);
}

#[test]
fn put_existing_accepts_foreign_history_and_conflicts() {
    let f = fixture();
    let coll = f.db.default_collection().unwrap();
    let history: Vec<RevId> = ["3-c", "2-b", "1-a"]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();
    let result = coll
        .put_existing("d", &history, body(&["A"]), false, None)
        .unwrap();
    assert!(result.inserted);

    let branch: Vec<RevId> = ["3-z", "2-b"].iter().map(|s| s.parse().unwrap()).collect();
    coll.put_existing("d", &branch, body(&["A"]), false, None)
        .unwrap();
    let record = coll.document("d").unwrap().unwrap();
    assert_eq!(record.current_rev, Some("3-z".parse().unwrap()));
    assert!(record.tree.has_conflicts());

    let repeat = coll
        .put_existing("d", &branch, body(&["A"]), false, None)
        .unwrap();
    assert!(!repeat.inserted);
    assert_eq!(repeat.sequence, 0);
}

#[test]
fn cas_failures_are_retried() {
    let f = open(
        DatabaseConfig::new("t").with_cas_retry(
            RetryConfig::new(5)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        ),
    );
    let coll = f.db.default_collection().unwrap();
    f.store.inject_cas_failures(2);

    let result = coll.put("d", None, body(&["A"]), None).unwrap();
    assert_eq!(result.sequence, 3);
    assert!(f.store.get("_sync:unused:_default:1").unwrap().is_some());
    assert!(f.store.get("_sync:unused:_default:2").unwrap().is_some());
    assert_eq!(coll.cache().stable_sequence(), 3);
}

#[test]
fn exhausted_retries_report_retryable_conflict() {
    let f = open(DatabaseConfig::new("t").with_cas_retry(
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false),
    ));
    let coll = f.db.default_collection().unwrap();
    f.store.inject_cas_failures(10);

    let err = coll.put("d", None, body(&["A"]), None).unwrap_err();
    assert!(matches!(err, CoreError::Conflict { attempts: 3, .. }));
    assert!(err.is_retryable());
    assert_eq!(coll.cache().stable_sequence(), 3);
}

#[test]
fn channel_moves_write_removal_rows() {
    let f = fixture();
    let coll = f.db.default_collection().unwrap();
    let r1 = coll.put("d", None, body(&["A"]), None).unwrap().rev;
    coll.put("d", Some(&r1), body(&["B"]), None).unwrap();

    let rows = f.index.query("A", 0, 10, 0).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[1].removed);
    assert_eq!(f.index.channel_len(STAR_CHANNEL), 2);

    let mut feed = coll.changes(UserContext::new("u", ["A"]), FeedOptions::since(0));
    let events = feed.next_batch(10).unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].as_change().unwrap().removed);
}

#[test]
fn deletion_stays_in_channels() {
    let f = fixture();
    let coll = f.db.default_collection().unwrap();
    let r1 = coll.put("d", None, body(&["A"]), None).unwrap().rev;
    let del = coll.delete("d", &r1).unwrap();

    let record = coll.document("d").unwrap().unwrap();
    assert!(record.deleted);
    assert_eq!(record.channels, chans(&["A"]));

    let mut feed = coll.changes(UserContext::new("u", ["A"]), FeedOptions::since(0));
    let events = feed.next_batch(10).unwrap();
    let entry = events[0].as_change().unwrap();
    assert!(entry.deleted);
    assert!(!entry.removed);
    assert_eq!(entry.rev_id, del.rev.to_string());

    let recreated = coll.put("d", None, body(&["A"]).with("back", true), None).unwrap();
    assert_eq!(recreated.rev.generation(), 3);
}

#[test]
fn get_rev_reports_unavailable_reasons() {
    let f = open(DatabaseConfig::new("t").with_revs_limit(2));
    let coll = f.db.default_collection().unwrap();

    let missing = coll.get_rev("nope", &"1-a".parse().unwrap(), 10).unwrap_err();
    assert!(matches!(
        missing,
        CoreError::RevisionUnavailable { reason: UnavailableReason::Missing, .. }
    ));

    let mut parent = None;
    let mut revs = Vec::new();
    for i in 0..4 {
        let rev = coll
            .put("d", parent.as_ref(), body(&["A"]).with("i", i), None)
            .unwrap()
            .rev;
        revs.push(rev.clone());
        parent = Some(rev);
    }

    let current = coll.get_rev("d", &revs[3], 10).unwrap();
    assert_eq!(current.history, vec![revs[3].clone(), revs[2].clone(), revs[1].clone()]);

    let pruned = coll.get_rev("d", &revs[0], 10).unwrap_err();
    assert!(matches!(
        pruned,
        CoreError::RevisionUnavailable { reason: UnavailableReason::Pruned, .. }
    ));
    let old_body = coll.get_rev("d", &revs[2], 10).unwrap_err();
    assert!(matches!(
        old_body,
        CoreError::RevisionUnavailable { reason: UnavailableReason::Pruned, .. }
    ));

    let other = UserContext::new("u", ["Z"]);
    let removed = coll.get_rev_for(&other, "d", &revs[3], 10).unwrap_err();
    assert!(matches!(
        removed,
        CoreError::RevisionUnavailable { reason: UnavailableReason::Removed, .. }
    ));
    assert_eq!(removed.status_code(), 403);

    coll.purge("d").unwrap();
    let purged = coll.get_rev("d", &revs[3], 10).unwrap_err();
    assert!(matches!(
        purged,
        CoreError::RevisionUnavailable { reason: UnavailableReason::Purged, .. }
    ));
    assert_eq!(f.index.channel_len("A"), 0);
}

#[test]
fn corrupt_record_is_quarantined() {
    let f = fixture();
    let coll = f.db.default_collection().unwrap();
    let r1 = coll.put("good", None, body(&["A"]), None).unwrap().rev;
    coll.put("bad", None, body(&["A"]), None).unwrap();
    f.store.set("_sync:doc:_default:bad", b"not cbor".to_vec()).unwrap();

    let err = coll.get_rev("bad", &r1, 10).unwrap_err();
    assert!(matches!(
        err,
        CoreError::RevisionUnavailable { reason: UnavailableReason::Corrupt, .. }
    ));
    assert!(coll.cache().is_quarantined("bad"));

    let mut feed = coll.changes(UserContext::new("u", ["A"]), FeedOptions::since(0));
    let ids: Vec<String> = feed
        .next_batch(10)
        .unwrap()
        .iter()
        .filter_map(|e| e.as_change().map(|c| c.doc_id.clone()))
        .collect();
    assert_eq!(ids, vec!["good"]);

    assert!(coll.get("good").is_ok());
}

#[test]
fn attachments_are_content_addressed() {
    let f = fixture();
    let coll = f.db.collection("hotels").unwrap();
    let digest = coll.put_attachment(b"picture").unwrap();
    assert_eq!(coll.put_attachment(b"picture").unwrap(), digest);
    assert_eq!(coll.get_attachment(&digest).unwrap().unwrap(), b"picture");

    let mut doc = body(&["A"]);
    doc.attachments.insert(
        "photo.jpg".into(),
        docsync_core::AttachmentMeta {
            digest: digest.clone(),
            length: 7,
            content_type: Some("image/jpeg".into()),
            revpos: 0,
            stub: false,
        },
    );
    let rev = coll.put("h1", None, doc, None).unwrap().rev;
    assert!(coll.doc_references_attachment("h1", &digest).unwrap());
    assert!(!coll.doc_references_attachment("h1", "sha256-00").unwrap());

    let stored = coll.get_rev("h1", &rev, 1).unwrap();
    let meta = &stored.body.attachments["photo.jpg"];
    assert_eq!(meta.revpos, 1);
    assert!(meta.stub);
}

#[test]
fn collections_have_independent_sequences() {
    let f = fixture();
    let default = f.db.default_collection().unwrap();
    let hotels = f.db.collection("hotels").unwrap();
    assert_eq!(default.put("a", None, body(&["A"]), None).unwrap().sequence, 1);
    assert_eq!(hotels.put("a", None, body(&["A"]), None).unwrap().sequence, 1);
    assert_eq!(default.put("b", None, body(&["A"]), None).unwrap().sequence, 2);
    assert_eq!(hotels.last_sequence().unwrap(), 1);
}

#[test]
fn writes_from_another_node_reach_the_cache_via_the_feed() {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemoryIndex::new());
    let writer = Database::open(DatabaseConfig::new("t"), store.clone(), index.clone()).unwrap();
    let reader = Arc::new(Database::open(DatabaseConfig::new("t"), store.clone(), index).unwrap());
    let listener = reader.spawn_change_listener();

    let coll = writer.default_collection().unwrap();
    coll.put("d", None, body(&["A"]), None).unwrap();

    let reader_coll = reader.default_collection().unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while reader_coll.cache().stable_sequence() < 1 {
        assert!(std::time::Instant::now() < deadline, "change never arrived");
        std::thread::sleep(Duration::from_millis(5));
    }
    listener.stop();

    let mut feed = reader_coll.changes(UserContext::new("u", ["A"]), FeedOptions::since(0));
    assert_eq!(feed.next_batch(10).unwrap().len(), 1);
}

#[test]
fn feed_path_indexes_before_caching() {
    let store = Arc::new(MemoryStore::new());
    let writer_index = Arc::new(MemoryIndex::new());
    let reader_index = Arc::new(MemoryIndex::new());
    let writer = Database::open(DatabaseConfig::new("t"), store.clone(), writer_index).unwrap();
    let reader =
        Database::open(DatabaseConfig::new("t"), store.clone(), reader_index.clone()).unwrap();
    let rx = store.subscribe();

    let coll = writer.default_collection().unwrap();
    coll.put("d", None, body(&["A"]), None).unwrap();
    while let Ok(m) = rx.try_recv() {
        reader.process_mutation(&m);
    }

    let reader_coll = reader.default_collection().unwrap();
    assert_eq!(reader_coll.cache().channel("A").unwrap().len(), 1);
    let rows = reader_index.query("A", 0, 10, 0).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].doc_id, "d");
    assert_eq!(rows[0].sequence, 1);
    assert_eq!(reader_index.query(STAR_CHANNEL, 0, 10, 0).unwrap().len(), 1);
}

#[test]
fn local_write_and_feed_index_once() {
    let f = fixture();
    let coll = f.db.default_collection().unwrap();
    let rx = f.store.subscribe();
    coll.put("d", None, body(&["A"]), None).unwrap();
    while let Ok(m) = rx.try_recv() {
        f.db.process_mutation(&m);
    }
    assert_eq!(f.index.query("A", 0, 10, 0).unwrap().len(), 1);
}

#[test]
fn duplicate_mutations_are_ignored() {
    let f = fixture();
    let coll = f.db.default_collection().unwrap();
    let rx = f.store.subscribe();
    coll.put("d", None, body(&["A"]), None).unwrap();
    let mut seen = 0;
    while let Ok(m) = rx.try_recv() {
        if !f.db.process_mutation(&m) {
            seen += 1;
        }
    }
    assert!(seen >= 1);
    assert_eq!(coll.cache().channel("A").unwrap().len(), 1);
}

#[test]
fn checkpoint_survives_reopen() {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemoryIndex::new());
    {
        let db = Database::open(DatabaseConfig::new("t"), store.clone(), index.clone()).unwrap();
        let coll = db.default_collection().unwrap();
        coll.checkpoints()
            .set(CheckpointOwner::Peer, "u", "client-1", None, 17, b"{\"x\":1}".to_vec())
            .unwrap();
    }
    let db = Database::open(DatabaseConfig::new("t"), store, index).unwrap();
    let cp = db
        .default_collection()
        .unwrap()
        .checkpoints()
        .get(CheckpointOwner::Peer, "u", "client-1")
        .unwrap()
        .unwrap();
    assert_eq!(cp.last_sequence, 17);
    assert_eq!(cp.body, b"{\"x\":1}");
}

#[test]
fn reopened_database_backfills_from_index() {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemoryIndex::new());
    {
        let db = Database::open(DatabaseConfig::new("t"), store.clone(), index.clone()).unwrap();
        let coll = db.default_collection().unwrap();
        for i in 0..5 {
            coll.put(&format!("d{i}"), None, body(&["A"]), None).unwrap();
        }
    }
    let db = Database::open(DatabaseConfig::new("t"), store, index.clone()).unwrap();
    let coll = db.default_collection().unwrap();
    assert_eq!(coll.cache().stable_sequence(), 5);

    let queries = index.query_count();
    let mut feed = coll.changes(UserContext::new("u", ["A"]), FeedOptions::since(0));
    assert_eq!(feed.next_batch(100).unwrap().len(), 5);
    assert!(index.query_count() > queries);
}

#[test]
fn small_cache_backfill_matches_large_cache() {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemoryIndex::new());
    let small = Database::open(
        DatabaseConfig::new("t").with_cache(CacheConfig::new().with_max_length(3)),
        store.clone(),
        index.clone(),
    )
    .unwrap();
    let coll = small.default_collection().unwrap();

    let mut revs = std::collections::HashMap::new();
    for i in 0..20u32 {
        let doc = format!("d{}", i % 7);
        let parent = revs.get(&doc).cloned();
        let rev = coll
            .put(&doc, parent.as_ref(), body(&["A"]).with("i", i), None)
            .unwrap()
            .rev;
        revs.insert(doc, rev);
    }

    let cache = coll.cache().channel("A").unwrap();
    assert_eq!(cache.len(), 3);
    let through_window: Vec<_> = coll.cache().since("A", 0, 20).collect();
    let from_index = cache.backfill_from(0, 20).unwrap();
    assert_eq!(through_window, from_index);
    assert_eq!(through_window.len(), 7);

    let seqs: Vec<u64> = through_window.iter().map(|e| e.sequence).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn feed_events_expose_sequences() {
    let f = fixture();
    let coll = f.db.default_collection().unwrap();
    coll.put("a", None, body(&["A"]), None).unwrap();
    let mut feed = coll.changes(UserContext::admin("root"), FeedOptions::since(0));
    let events = feed.next_batch(10).unwrap();
    assert!(matches!(&events[0], FeedEvent::Change(e) if e.sequence == 1));
}
