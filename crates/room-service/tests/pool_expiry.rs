//! Idle room expiration through the pool, on a paused clock.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use common::{eventually, pool_with, TestClient};
use room_service::actors::{ConnectionHandle, PoolConfig};
use room_service::errors::RoomError;
use room_service::negotiation::mock::MockNegotiationBackend;
use room_service::transport::join_room;
use serde_json::json;

const IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Sweeps only run when a test asks for one.
fn manual_sweep() -> PoolConfig {
    PoolConfig {
        idle_timeout: IDLE_TIMEOUT,
        sweep_interval: Duration::from_secs(86_400 * 365),
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_room_says_goodbye_and_is_removed() {
    let backend = MockNegotiationBackend::accepting();
    let pool = pool_with(&backend, manual_sweep());
    let room = pool.get_or_create("chatroom".to_string()).await.unwrap();
    let (mut alice, _) = TestClient::join(&room, "a", "Alice").await;

    tokio::time::advance(IDLE_TIMEOUT + Duration::from_secs(1)).await;
    assert_eq!(pool.sweep().await.unwrap(), 1);

    assert_eq!(alice.next().await, json!("bye"));
    assert_eq!(alice.next().await, json!({"closed": "detached from room"}));
    assert!(pool.get("chatroom".to_string()).await.unwrap().is_none());
    assert!(matches!(room.report().await, Err(RoomError::RoomClosed)));
}

#[tokio::test(start_paused = true)]
async fn test_activity_postpones_expiry() {
    let backend = MockNegotiationBackend::accepting();
    let pool = pool_with(&backend, manual_sweep());
    let room = pool.get_or_create("chatroom".to_string()).await.unwrap();
    let mut alice = TestClient::connect(&room, "a").await;

    tokio::time::advance(Duration::from_secs(3000)).await;
    alice.send(json!({"id": "ping"})).await;
    assert_eq!(alice.next().await, json!({"id": "pong"}));

    tokio::time::advance(Duration::from_secs(3000)).await;
    assert_eq!(pool.sweep().await.unwrap(), 0);
    assert!(pool.get("chatroom".to_string()).await.unwrap().is_some());

    tokio::time::advance(Duration::from_secs(601)).await;
    assert_eq!(pool.sweep().await.unwrap(), 1);
    assert_eq!(pool.status().await.unwrap().room_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_background_sweep_evicts_idle_rooms() {
    let backend = MockNegotiationBackend::accepting();
    let pool = pool_with(
        &backend,
        PoolConfig {
            idle_timeout: IDLE_TIMEOUT,
            sweep_interval: Duration::from_secs(60),
        },
    );
    let room = pool.get_or_create("chatroom".to_string()).await.unwrap();

    tokio::time::sleep(IDLE_TIMEOUT + Duration::from_secs(120)).await;

    assert!(pool.get("chatroom".to_string()).await.unwrap().is_none());
    eventually(|| room.is_closed()).await;
}

#[tokio::test(start_paused = true)]
async fn test_eviction_releases_backend_sessions() {
    let backend = MockNegotiationBackend::accepting();
    let pool = pool_with(&backend, manual_sweep());
    let room = pool.get_or_create("chatroom".to_string()).await.unwrap();
    let (alice, _) = TestClient::join(&room, "a", "Alice").await;
    let (mut bob, _) = TestClient::join(&room, "b", "Bob").await;

    alice
        .send(json!({"id": "publish", "channel": "cam", "sdpOffer": "a=sendonly"}))
        .await;
    bob.next_with_id("startPublishing").await;
    bob.send(json!({"id": "subscribe", "channel": "cam", "sdpOffer": "a=recvonly"}))
        .await;
    bob.next_with_id("startResponseForSubscriber").await;
    assert_eq!(backend.live_sessions(), 2);

    tokio::time::advance(IDLE_TIMEOUT + Duration::from_secs(1)).await;
    assert_eq!(pool.sweep().await.unwrap(), 1);

    eventually(|| backend.live_sessions() == 0).await;
    assert_eq!(backend.released_count(), 2);
    assert_eq!(
        bob.drain().await,
        vec![json!("bye"), json!({"closed": "detached from room"})]
    );
}

#[tokio::test(start_paused = true)]
async fn test_join_after_eviction_creates_fresh_room() {
    let backend = MockNegotiationBackend::accepting();
    let pool = pool_with(&backend, manual_sweep());
    let first = pool.get_or_create("chatroom".to_string()).await.unwrap();

    tokio::time::advance(IDLE_TIMEOUT + Duration::from_secs(1)).await;
    assert_eq!(pool.sweep().await.unwrap(), 1);

    let (connection, _rx) = ConnectionHandle::new("p1", 16);
    let room = join_room(&pool, "chatroom", "p1", connection).await.unwrap();

    assert!(first.is_cancelled());
    assert!(!room.is_cancelled());
    let report = room.report().await.unwrap();
    assert_eq!(report.id, "chatroom");
    assert!(report.participants.is_empty());
    assert_eq!(pool.status().await.unwrap().room_count, 1);
}
