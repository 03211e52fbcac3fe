use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Everything a lobby operation can fail with. `Display` strings are the
/// client-facing messages; storage detail stays out of them.
#[derive(Debug, Error)]
pub enum LobbyError {
    #[error("Room not found")]
    RoomNotFound,

    #[error("Not in a room")]
    NotInRoom,

    #[error("Game has already started")]
    AlreadyStarted,

    #[error("Room is full")]
    RoomFull,

    #[error("Username already taken in this room")]
    NameTaken,

    #[error("Only the host can {0}")]
    NotHost(&'static str),

    #[error("Chat is disabled in this room")]
    ChatDisabled,

    #[error("Need at least {0} players to start")]
    NotEnoughPlayers(usize),

    #[error("Not all players are ready")]
    NotAllReady,

    #[error("Unknown message type")]
    UnknownMessage,

    #[error("Failed to process message")]
    Malformed,

    #[error("Storage error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Storage call timed out")]
    StoreTimeout,

    #[error("Could not allocate a unique room code")]
    CodeExhausted,
}

impl LobbyError {
    /// Message for the `error` envelope sent back over the socket.
    pub fn client_message(&self) -> String {
        match self {
            LobbyError::Store(_) | LobbyError::StoreTimeout | LobbyError::CodeExhausted => {
                "Internal server error".to_owned()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for LobbyError {
    fn into_response(self) -> Response {
        let status = match &self {
            LobbyError::RoomNotFound | LobbyError::NotInRoom => StatusCode::NOT_FOUND,
            LobbyError::NotHost(_) | LobbyError::ChatDisabled => StatusCode::FORBIDDEN,
            LobbyError::RoomFull | LobbyError::NameTaken => StatusCode::CONFLICT,
            LobbyError::AlreadyStarted => StatusCode::BAD_REQUEST,
            LobbyError::NotEnoughPlayers(_) | LobbyError::NotAllReady => {
                StatusCode::PRECONDITION_FAILED
            }
            LobbyError::UnknownMessage | LobbyError::Malformed => StatusCode::BAD_REQUEST,
            LobbyError::Store(_) | LobbyError::StoreTimeout | LobbyError::CodeExhausted => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = serde_json::json!({
            "message": self.client_message(),
        });

        (status, Json(body)).into_response()
    }
}
