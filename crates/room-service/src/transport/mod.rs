//! WebSocket transport and inspection route.
//!
//! - `GET /<roomId>`: WebSocket upgrade. One connection is one participant;
//!   its id is a fresh UUID. Rooms not on the allow-list are refused with
//!   `Wrong room id: <roomId>` and closed.
//! - `GET /inspect`: JSON list of room reports.
//!
//! Each socket is served by a single task that alternates between the
//! connection's outbound queue and inbound frames. The room never touches
//! the socket.

use crate::actors::{
    ConnectionHandle, ConnectionMessage, DisconnectReason, RoomHandle, RoomPoolHandle,
    CONNECTION_CHANNEL_BUFFER,
};
use crate::errors::RoomError;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared state of the signaling routes.
#[derive(Clone)]
pub struct AppState {
    pool: RoomPoolHandle,
    allowed_rooms: Arc<HashSet<String>>,
}

impl AppState {
    #[must_use]
    pub fn new(pool: RoomPoolHandle, allowed_rooms: impl IntoIterator<Item = String>) -> Self {
        Self {
            pool,
            allowed_rooms: Arc::new(allowed_rooms.into_iter().collect()),
        }
    }

    #[must_use]
    pub fn is_allowed(&self, room_id: &str) -> bool {
        self.allowed_rooms.contains(room_id)
    }
}

/// Router serving `/inspect` and the per-room WebSocket endpoint.
pub fn signaling_router(state: AppState) -> Router {
    Router::new()
        .route("/inspect", get(inspect_handler))
        .route("/:room_id", get(ws_handler))
        .with_state(state)
}

async fn inspect_handler(State(state): State<AppState>) -> Response {
    match state.pool.report().await {
        Ok(reports) => Json(reports).into_response(),
        Err(e) => {
            warn!(target: "rs.transport", error = %e, "Inspection unavailable");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_failed_upgrade(|error| {
        warn!(target: "rs.transport", error = %error, "WebSocket upgrade failed");
    })
    .on_upgrade(move |socket| handle_socket(socket, state, room_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, room_id: String) {
    if !state.is_allowed(&room_id) {
        warn!(
            target: "rs.transport",
            room_id = %room_id,
            "Connection to unknown room refused"
        );
        let _ = socket
            .send(Message::Text(format!("Wrong room id: {room_id}")))
            .await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let participant_id = Uuid::new_v4().to_string();
    let (connection, outbound) =
        ConnectionHandle::new(participant_id.clone(), CONNECTION_CHANNEL_BUFFER);

    let room = match join_room(&state.pool, &room_id, &participant_id, connection).await {
        Ok(room) => room,
        Err(e) => {
            warn!(
                target: "rs.transport",
                room_id = %room_id,
                participant_id = %participant_id,
                error = %e,
                "Failed to join room"
            );
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    info!(
        target: "rs.transport",
        room_id = %room_id,
        participant_id = %participant_id,
        "Client connected"
    );

    // The outbound receiver is dropped on return, so the room sees the
    // connection as closed when it handles the disconnect.
    let reason = serve_connection(socket, outbound, &room, &participant_id).await;

    info!(
        target: "rs.transport",
        room_id = %room_id,
        participant_id = %participant_id,
        reason = %reason.as_str(),
        "Client disconnected"
    );

    if let Err(e) = room.disconnected(participant_id, reason).await {
        debug!(
            target: "rs.transport",
            room_id = %room_id,
            error = %e,
            "Room gone before disconnect"
        );
    }
}

/// Hand a connection to its room, creating the room if needed.
///
/// A room can shut down between lookup and join (idle eviction); the lookup
/// is retried once.
pub async fn join_room(
    pool: &RoomPoolHandle,
    room_id: &str,
    participant_id: &str,
    connection: ConnectionHandle,
) -> Result<RoomHandle, RoomError> {
    let room = pool.get_or_create(room_id.to_string()).await?;
    match room
        .join(participant_id.to_string(), connection.clone())
        .await
    {
        Ok(()) => Ok(room),
        Err(RoomError::RoomClosed) => {
            debug!(
                target: "rs.transport",
                room_id = %room_id,
                "Room closed before join, retrying lookup"
            );
            let room = pool.get_or_create(room_id.to_string()).await?;
            room.join(participant_id.to_string(), connection).await?;
            Ok(room)
        }
        Err(e) => Err(e),
    }
}

async fn serve_connection(
    mut socket: WebSocket,
    mut outbound: mpsc::Receiver<ConnectionMessage>,
    room: &RoomHandle,
    participant_id: &str,
) -> DisconnectReason {
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(ConnectionMessage::Text(text)) => {
                        if let Err(e) = socket.send(Message::Text(text)).await {
                            return DisconnectReason::Error(e.to_string());
                        }
                    }
                    Some(ConnectionMessage::Close { reason }) => {
                        debug!(
                            target: "rs.transport",
                            participant_id = %participant_id,
                            reason = %reason,
                            "Closing connection"
                        );
                        let _ = socket.send(Message::Close(None)).await;
                        return DisconnectReason::Closed;
                    }
                    None => return DisconnectReason::Closed,
                }
            }

            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!(
                                target: "rs.transport",
                                participant_id = %participant_id,
                                "Non-UTF-8 binary frame ignored"
                            );
                            continue;
                        }
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return DisconnectReason::Closed,
                    Some(Err(e)) => return DisconnectReason::Error(e.to_string()),
                };

                if room.inbound(participant_id.to_string(), text).await.is_err() {
                    return DisconnectReason::Error("room closed".to_string());
                }
            }
        }
    }
}
