//! Wire envelopes: `{type, payload}` JSON in both directions.
//!
//! Decode is two-stage so the two protocol failures stay distinct: an
//! unrecognized `type` answers "Unknown message type", a payload that does
//! not match its kind answers "Failed to process message". Both go to the
//! sender only.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::LobbyError;
use crate::store::{Message, Player, Room, RoomSummary, RoomVisibility};

#[derive(Debug, Deserialize)]
struct Inbound {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ClientKind {
    Connect,
    CreateRoom,
    JoinRoom,
    LeaveRoom,
    ChatMessage,
    PlayerReady,
    StartGame,
    UpdateRoomSettings,
}

#[derive(Debug, Deserialize)]
pub struct Connect {
    pub username: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoom {
    pub name: String,
    #[serde(rename = "type")]
    pub visibility: RoomVisibility,
    pub capacity: i64,
    pub allow_chat: bool,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinRoom {
    pub code: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoom {
    /// Advisory: the session binding decides which player actually leaves.
    pub player_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct PlayerReady {
    pub ready: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoomSettings {
    pub room_id: Uuid,
    pub settings: RoomSettings,
}

#[derive(Debug, Deserialize)]
pub struct RoomSettings {
    #[serde(rename = "type")]
    pub visibility: Option<RoomVisibility>,
}

#[derive(Debug)]
pub enum ClientEnvelope {
    Connect(Connect),
    CreateRoom(CreateRoom),
    JoinRoom(JoinRoom),
    LeaveRoom(LeaveRoom),
    ChatMessage(ChatMessage),
    PlayerReady(PlayerReady),
    StartGame,
    UpdateRoomSettings(UpdateRoomSettings),
}

pub fn decode(text: &str) -> Result<ClientEnvelope, LobbyError> {
    let Inbound { kind, payload } =
        serde_json::from_str(text).map_err(|_| LobbyError::Malformed)?;
    let kind: ClientKind = serde_json::from_value(Value::String(kind))
        .map_err(|_| LobbyError::UnknownMessage)?;
    Ok(match kind {
        ClientKind::Connect => ClientEnvelope::Connect(payload_as(payload)?),
        ClientKind::CreateRoom => ClientEnvelope::CreateRoom(payload_as(payload)?),
        ClientKind::JoinRoom => ClientEnvelope::JoinRoom(payload_as(payload)?),
        ClientKind::LeaveRoom => ClientEnvelope::LeaveRoom(payload_as(payload)?),
        ClientKind::ChatMessage => ClientEnvelope::ChatMessage(payload_as(payload)?),
        ClientKind::PlayerReady => ClientEnvelope::PlayerReady(payload_as(payload)?),
        ClientKind::StartGame => ClientEnvelope::StartGame,
        ClientKind::UpdateRoomSettings => {
            ClientEnvelope::UpdateRoomSettings(payload_as(payload)?)
        }
    })
}

fn payload_as<T: DeserializeOwned>(payload: Value) -> Result<T, LobbyError> {
    serde_json::from_value(payload).map_err(|_| LobbyError::Malformed)
}

#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEnvelope {
    Connect {
        username: String,
        connected: bool,
    },
    CreateRoom {
        room: Room,
        player: Player,
        success: bool,
    },
    JoinRoom {
        room: Room,
        players: Vec<Player>,
        player: Player,
        messages: Vec<Message>,
        success: bool,
    },
    LeaveRoom {
        success: bool,
    },
    ChatMessage {
        message: Message,
    },
    PlayerReady {
        player: Player,
        success: bool,
    },
    StartGame {
        started: bool,
    },
    UpdateRoomSettings {
        room: Room,
        success: bool,
    },
    RoomUpdate {
        room: Room,
        players: Vec<Player>,
        messages: Vec<Message>,
    },
    RoomListUpdate {
        rooms: Vec<RoomSummary>,
    },
    Error {
        message: String,
    },
}

impl ServerEnvelope {
    pub fn error(err: &LobbyError) -> Self {
        Self::Error {
            message: err.client_message(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            tracing::error!(%err, "failed to encode outbound envelope");
            r#"{"type":"error","payload":{"message":"Internal server error"}}"#.to_owned()
        })
    }
}
