pub mod broadcast;
pub mod code;
pub mod lobby;
pub mod protocol;
pub mod registry;
pub mod ws;

#[cfg(test)]
mod tests;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router, debug_handler};
use serde::Serialize;

use crate::AppState;
use crate::error::LobbyError;
use crate::rooms::broadcast::public_room_summaries;
use crate::store::{Player, Room, RoomSummary, Store};

/// Read-only query surface: pure projections of the store, no lifecycle
/// side effects.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_rooms))
        .route("/{code}", get(room_by_code))
}

#[derive(Debug, Serialize)]
pub struct RoomWithPlayers {
    #[serde(flatten)]
    pub room: Room,
    pub players: Vec<Player>,
}

#[debug_handler]
async fn list_rooms(State(store): State<Store>) -> Result<Json<Vec<RoomSummary>>, LobbyError> {
    let rooms = public_room_summaries(&store).await?;
    Ok(Json(rooms))
}

#[debug_handler]
async fn room_by_code(
    State(store): State<Store>,
    Path(code): Path<String>,
) -> Result<Json<RoomWithPlayers>, LobbyError> {
    let room = store
        .room_by_code(&code)
        .await?
        .ok_or(LobbyError::RoomNotFound)?;
    let players = store.players_in_room(room.id).await?;
    Ok(Json(RoomWithPlayers { room, players }))
}
