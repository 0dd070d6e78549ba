//! Shared helpers for room integration tests.
//!
//! A `TestClient` stands in for the transport: it owns the receiving side of
//! a `ConnectionHandle` and decodes frames back into JSON.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use room_service::actors::{
    ActorMetrics, ConnectionHandle, ConnectionMessage, DisconnectReason, PoolConfig, RoomHandle,
    RoomPoolHandle,
};
use room_service::negotiation::mock::MockNegotiationBackend;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// How long to wait for a frame that must arrive.
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait before concluding no frame is coming.
const SILENCE_WINDOW: Duration = Duration::from_millis(50);

pub fn pool_with(backend: &MockNegotiationBackend, config: PoolConfig) -> RoomPoolHandle {
    RoomPoolHandle::new(config, Arc::new(backend.clone()), ActorMetrics::new())
}

pub struct TestClient {
    pub id: String,
    room: RoomHandle,
    rx: Option<mpsc::Receiver<ConnectionMessage>>,
}

impl TestClient {
    /// Connect to `room` and consume the greeting.
    pub async fn connect(room: &RoomHandle, id: &str) -> Self {
        let (connection, rx) = ConnectionHandle::new(id, 256);
        room.join(id.to_string(), connection).await.unwrap();

        let mut client = Self {
            id: id.to_string(),
            room: room.clone(),
            rx: Some(rx),
        };
        let greeting = client.next().await;
        assert_eq!(
            greeting,
            json!(format!(
                "Hello, new participant in room '{}'. Your id is '{id}'",
                room.room_id()
            ))
        );
        client
    }

    /// Connect and send `join`, consuming welcome, peoples and the roster.
    /// Returns the `peoples` frame.
    pub async fn join(room: &RoomHandle, id: &str, name: &str) -> (Self, Value) {
        let mut client = Self::connect(room, id).await;
        client.send(json!({"id": "join", "name": name})).await;

        assert_eq!(
            client.next().await,
            json!({"id": "welcome", "participantId": id})
        );
        let peoples = client.next().await;
        let roster = client.next().await;
        assert_eq!(roster.get("id"), Some(&json!("publications")));
        (client, peoples)
    }

    pub async fn send(&self, message: Value) {
        self.send_text(&message.to_string()).await;
    }

    pub async fn send_text(&self, text: &str) {
        self.room
            .inbound(self.id.clone(), text.to_string())
            .await
            .unwrap();
    }

    /// Next frame: JSON text decoded, other text as a JSON string, and a
    /// close as `{"closed": reason}`.
    pub async fn next(&mut self) -> Value {
        let rx = self.rx.as_mut().expect("client already disconnected");
        let frame = tokio::time::timeout(FRAME_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection queue closed");
        decode(frame)
    }

    /// Next raw text frame.
    pub async fn next_text(&mut self) -> String {
        let rx = self.rx.as_mut().expect("client already disconnected");
        let frame = tokio::time::timeout(FRAME_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection queue closed");
        match frame {
            ConnectionMessage::Text(text) => text,
            ConnectionMessage::Close { reason } => format!("<closed: {reason}>"),
        }
    }

    /// Skip frames until one with the given `id` arrives.
    pub async fn next_with_id(&mut self, id: &str) -> Value {
        loop {
            let frame = self.next().await;
            if frame.get("id") == Some(&json!(id)) {
                return frame;
            }
        }
    }

    /// Every frame that arrives within the silence window.
    pub async fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        let Some(rx) = self.rx.as_mut() else {
            return frames;
        };
        while let Ok(Some(frame)) = tokio::time::timeout(SILENCE_WINDOW, rx.recv()).await {
            frames.push(decode(frame));
        }
        frames
    }

    pub async fn assert_silent(&mut self) {
        assert_eq!(self.drain().await, Vec::<Value>::new());
    }

    /// Simulate the transport going away: drop the queue, then report it.
    pub async fn disconnect(&mut self) {
        self.rx = None;
        self.room
            .disconnected(self.id.clone(), DisconnectReason::Closed)
            .await
            .unwrap();
    }
}

fn decode(frame: ConnectionMessage) -> Value {
    match frame {
        ConnectionMessage::Text(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        ConnectionMessage::Close { reason } => json!({ "closed": reason }),
    }
}

/// Poll `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check(), "condition not reached in time");
}
