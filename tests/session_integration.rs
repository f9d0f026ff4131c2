//! End-to-end session tests against a real server.

mod common;

use common::*;
use futures_util::SinkExt;
use serde_json::json;
use std::time::Duration;
use story_collab::services::persistence::PersistenceGateway;
use tokio_tungstenite::tungstenite::Error as WsError;

#[tokio::test]
async fn rejects_missing_or_invalid_credentials() {
    let server = start_server().await;

    for url in [
        server.ws_url(),
        format!("{}?token=not-a-jwt", server.ws_url()),
    ] {
        match tokio_tungstenite::connect_async(url).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
            Err(e) => panic!("expected 401, got {e}"),
            Ok(_) => panic!("expected 401, connection was accepted"),
        }
    }
    assert_eq!(server.hub.snapshot().await.n_conn, 0);
}

#[tokio::test]
async fn rejects_everything_without_a_configured_secret() {
    let config = story_collab::config::Config::default();
    let server = start_server_with(config).await;
    let url = format!("{}?token={}", server.ws_url(), token(1, "ann"));
    assert!(matches!(
        tokio_tungstenite::connect_async(url).await,
        Err(WsError::Http(response)) if response.status() == 401
    ));
}

#[tokio::test]
async fn contended_lock_keeps_the_first_holder() {
    let server = start_server().await;
    server.gateway.insert_block(42, "b1", "It was a dark night").await;
    let mut a = join(&server, 1, "ann", Some(42)).await;
    let mut b = join(&server, 2, "bo", Some(42)).await;

    send(&mut a, json!({"type": "lock_block", "blockId": "b1", "storyId": 42})).await;
    for ws in [&mut a, &mut b] {
        let msg = recv(ws).await;
        assert_eq!(msg["type"], "lock_block");
        assert_eq!(msg["blockId"], "b1");
        assert_eq!(msg["userId"], 1);
        assert_eq!(msg["username"], "ann");
    }

    send(&mut b, json!({"type": "lock_block", "blockId": "b1", "storyId": 42})).await;
    expect_silence(&mut b, 300).await;
    expect_silence(&mut a, 50).await;

    let block = server.gateway.load_block("b1").await.unwrap().unwrap();
    assert_eq!(block.locked_by, Some(1));
}

#[tokio::test]
async fn story_content_is_broadcast_even_when_persistence_fails() {
    let server = start_server().await;
    let mut a = join(&server, 1, "ann", Some(7)).await;
    let mut b = join(&server, 2, "bo", Some(7)).await;
    server.gateway.set_failing(true);

    send(
        &mut a,
        json!({"type": "update_story_content", "storyId": 7, "content": "Once upon a time", "userId": 1, "username": "ann"}),
    )
    .await;

    for ws in [&mut a, &mut b] {
        let msg = recv(ws).await;
        assert_eq!(msg["type"], "story_content_updated");
        assert_eq!(msg["content"], "Once upon a time");
        assert_eq!(msg["storyId"], 7);
        assert_eq!(msg["last_edited_by_name"], "ann");
        assert!(msg["lastEditedAt"].is_string());
    }

    let err = recv(&mut a).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["message"], "Failed to update story content");
    assert!(err["details"].is_string());
    expect_silence(&mut b, 200).await;
}

#[tokio::test]
async fn abnormal_disconnect_releases_held_locks() {
    let server = start_server().await;
    let mut a = join(&server, 1, "ann", Some(42)).await;
    let mut b = join(&server, 2, "bo", Some(42)).await;

    send(&mut a, json!({"type": "lock_block", "blockId": "b2", "storyId": 42})).await;
    assert_eq!(recv(&mut b).await["type"], "lock_block");

    // Drop the socket without a close handshake
    drop(a);

    let msg = recv(&mut b).await;
    assert_eq!(msg, json!({"type": "unlock_block", "blockId": "b2", "storyId": 42}));
    assert_eq!(server.hub.snapshot().await.n_locks, 0);
}

#[tokio::test]
async fn malformed_payload_only_affects_the_sender() {
    let server = start_server().await;
    let mut a = join(&server, 1, "ann", Some(3)).await;
    let mut b = join(&server, 2, "bo", Some(3)).await;

    a.send(tokio_tungstenite::tungstenite::Message::text("{oops")).await.unwrap();
    let err = recv(&mut a).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["message"], "Failed to process message");
    expect_silence(&mut b, 200).await;

    // The connection stays usable
    send(&mut a, json!({"type": "typing", "storyId": 3})).await;
    assert_eq!(recv(&mut b).await, json!({"type": "typing", "storyId": 3, "username": "ann"}));
}

#[tokio::test]
async fn typing_is_scoped_to_the_story_and_cleared_on_close() {
    let server = start_server().await;
    let mut a = join(&server, 1, "ann", None).await;
    let mut b = join(&server, 2, "bo", Some(5)).await;
    let mut c = join(&server, 3, "cy", Some(6)).await;

    send(&mut a, json!({"type": "typing", "storyId": 5})).await;
    assert_eq!(recv(&mut b).await["type"], "typing");
    expect_silence(&mut c, 200).await;

    drop(a);
    assert_eq!(recv(&mut b).await, json!({"type": "stop_typing", "storyId": 5, "username": "ann"}));
    expect_silence(&mut c, 100).await;
}

#[tokio::test]
async fn join_story_reports_current_locks_and_typists() {
    let server = start_server().await;
    let mut a = join(&server, 1, "ann", Some(9)).await;
    let mut b = join(&server, 2, "bo", None).await;

    send(&mut a, json!({"type": "lock_block", "blockId": "b7", "storyId": 9})).await;
    send(&mut a, json!({"type": "typing", "storyId": 9})).await;
    recv(&mut a).await;
    recv(&mut a).await;

    send(&mut b, json!({"type": "join_story", "storyId": 9})).await;
    let state = recv(&mut b).await;
    assert_eq!(state["type"], "story_state");
    assert_eq!(state["locks"][0]["blockId"], "b7");
    assert_eq!(state["locks"][0]["userId"], 1);
    assert_eq!(state["typing"], json!(["ann"]));
}

#[tokio::test]
async fn block_edits_are_versioned_and_broadcast() {
    let server = start_server().await;
    server.gateway.insert_block(4, "b1", "draft").await;
    let mut a = join(&server, 1, "ann", Some(4)).await;
    let mut b = join(&server, 2, "bo", Some(4)).await;

    send(&mut a, json!({"type": "update_block", "blockId": "b1", "content": "final", "storyId": 4})).await;
    let msg = recv(&mut b).await;
    assert_eq!(msg["type"], "update_block");
    assert_eq!(msg["content"], "final");
    assert_eq!(msg["userId"], 1);
    assert!(msg["lastEditedAt"].is_string());

    let versions = server.gateway.versions().await;
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].content, "draft");
}

#[tokio::test]
async fn eviction_lets_the_frame_in_flight_finish_persisting() {
    let server = start_server().await;
    let mut a = join(&server, 1, "ann", Some(7)).await;
    server.gateway.set_latency(Duration::from_millis(300));

    send(&mut a, json!({"type": "update_story_content", "storyId": 7, "content": "Still saved"})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The reader is busy with the slow write, so both probes go unanswered
    server.hub.sweep().await;
    assert_eq!(server.hub.sweep().await, 1);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(server.gateway.story_content(7).await.as_deref(), Some("Still saved"));
    assert_eq!(server.hub.snapshot().await.n_conn, 0);
}
