//! Session admission and shutdown through [`SyncServer`].

use docsync_server::{
    duplex_pair, ServerConfig, SessionConfig, SessionError, SyncServer, DEFAULT_CAPACITY,
};
use docsync_testkit::prelude::*;
use serde_json::json;

fn server(db: &TestDatabase, max_sessions: usize) -> SyncServer {
    SyncServer::new(
        db.db.clone(),
        ServerConfig::default().with_max_sessions(max_sessions),
    )
    .unwrap()
}

#[tokio::test]
async fn test_session_limit_and_release() {
    init_test_logging();
    let db = TestDatabase::new();
    let server = server(&db, 1);

    let (server_end, peer_end) = duplex_pair(DEFAULT_CAPACITY);
    let handle = server.accept(server_end, db.admin()).unwrap();
    let mut peer = TestPeer::new(peer_end);
    peer.handshake_default().await;
    assert_eq!(server.session_count(), 1);

    let (second, _) = duplex_pair(DEFAULT_CAPACITY);
    let err = server.accept(second, db.admin()).unwrap_err();
    assert!(matches!(err, SessionError::TooManySessions { limit: 1 }));
    assert_eq!(err.status_code(), 503);

    // Hanging up frees the slot.
    drop(peer);
    handle.join().await.unwrap();
    assert_eq!(server.session_count(), 0);
    let (third, _peer) = duplex_pair(DEFAULT_CAPACITY);
    assert!(server.accept(third, db.admin()).is_ok());
}

#[tokio::test]
async fn test_close_session_by_id() {
    init_test_logging();
    let db = TestDatabase::new();
    let server = server(&db, 4);

    let (server_end, peer_end) = duplex_pair(DEFAULT_CAPACITY);
    let handle = server.accept(server_end, db.admin()).unwrap();
    let mut peer = TestPeer::new(peer_end);
    peer.handshake_default().await;

    let id = handle.id();
    assert!(server.close_session(id));
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.id, id);
    assert_eq!(server.session_count(), 0);
    assert!(!server.close_session(id));
}

#[tokio::test]
async fn test_shutdown_closes_streaming_sessions() {
    init_test_logging();
    let db = TestDatabase::new();
    db.put_json("doc", json!({}));
    let server = server(&db, 4);

    let mut peers = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let (server_end, peer_end) = duplex_pair(DEFAULT_CAPACITY);
        handles.push(server.accept(server_end, db.admin()).unwrap());
        let mut peer = TestPeer::new(peer_end);
        peer.handshake_default().await;
        peer.pull(SubscribeChanges {
            continuous: true,
            ..SubscribeChanges::default()
        })
        .await;
        peers.push(peer);
    }
    assert_eq!(server.session_count(), 3);

    server.shutdown().await;
    assert_eq!(server.session_count(), 0);
    for handle in handles {
        let summary = handle.join().await.unwrap();
        assert!(summary.error.is_none());
        assert_eq!(summary.acknowledged_sequence, 1);
    }

    let (late, _peer) = duplex_pair(DEFAULT_CAPACITY);
    assert!(matches!(
        server.accept(late, db.admin()),
        Err(SessionError::Cancelled)
    ));
}

#[test]
fn test_invalid_session_config_is_rejected() {
    let db = TestDatabase::new();
    let config = ServerConfig::default().with_session(SessionConfig::default().with_batch_size(0));
    assert!(SyncServer::new(db.db.clone(), config).is_err());
}
