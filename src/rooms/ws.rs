//! WebSocket transport and the protocol dispatcher.
//!
//! One task per socket drains the session's outbound channel into the sink;
//! the read loop feeds [`handle_message`]. The dispatcher itself is
//! transport-free so tests can drive it with raw JSON.

use axum::debug_handler;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::AppState;
use crate::error::LobbyError;
use crate::rooms::broadcast::{self, Fanout};
use crate::rooms::lobby;
use crate::rooms::protocol::{self, ClientEnvelope, ServerEnvelope};
use crate::rooms::registry::ConnId;

#[debug_handler]
pub async fn lobby_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let conn: ConnId = Uuid::now_v7();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.registry.register(conn, tx).await;
    debug!(%conn, "client connected");

    let (mut sender, mut receiver) = socket.split();
    let forward_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => handle_message(&state, conn, text.as_str()).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Socket closed (or errored): same removal path as an explicit leave.
    lobby::disconnect(&state, conn).await;
    forward_task.abort();
    debug!(%conn, "client disconnected");
}

/// Decode, route, reply, fan out. Errors become a single `error` envelope
/// to the sender; they never broadcast and never tear down the connection.
pub(crate) async fn handle_message(state: &AppState, conn: ConnId, text: &str) {
    match dispatch(state, conn, text).await {
        Ok((reply, fanout)) => {
            state.registry.send_to(conn, &reply.encode()).await;
            broadcast::run(state, fanout).await;
        }
        Err(err) => {
            debug!(%conn, %err, "request rejected");
            state
                .registry
                .send_to(conn, &ServerEnvelope::error(&err).encode())
                .await;
        }
    }
}

async fn dispatch(
    state: &AppState,
    conn: ConnId,
    text: &str,
) -> Result<(ServerEnvelope, Fanout), LobbyError> {
    match protocol::decode(text)? {
        ClientEnvelope::Connect(msg) => lobby::connect(state, conn, msg).await,
        ClientEnvelope::CreateRoom(msg) => lobby::create_room(state, conn, msg).await,
        ClientEnvelope::JoinRoom(msg) => lobby::join_room(state, conn, msg).await,
        ClientEnvelope::LeaveRoom(msg) => lobby::leave_room(state, conn, msg).await,
        ClientEnvelope::ChatMessage(msg) => lobby::chat_message(state, conn, msg).await,
        ClientEnvelope::PlayerReady(msg) => lobby::player_ready(state, conn, msg).await,
        ClientEnvelope::StartGame => lobby::start_game(state, conn).await,
        ClientEnvelope::UpdateRoomSettings(msg) => {
            lobby::update_room_settings(state, conn, msg).await
        }
    }
}
