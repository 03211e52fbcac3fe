//! Fan-out of state changes to subscribed connections.
//!
//! Which broadcasts a lifecycle operation triggers is part of its contract:
//! too few and clients silently desync, too many and private-room state
//! leaks. So operations return a [`Fanout`] value describing exactly what to
//! send, and this module executes it. Room snapshots are always full
//! (room + players + recent messages) so a client that missed an event
//! converges on the next one.

use tracing::warn;
use uuid::Uuid;

use crate::AppState;
use crate::error::LobbyError;
use crate::rooms::protocol::ServerEnvelope;
use crate::store::{RoomSummary, Store};

/// The broadcasts one lifecycle operation triggers.
#[derive(Debug, Default)]
pub struct Fanout {
    /// Pre-built envelopes delivered to a room's subscribers (chat, start).
    room_events: Vec<(Uuid, ServerEnvelope)>,
    /// Room to send a fresh `room_update` snapshot to.
    room_snapshot: Option<Uuid>,
    /// Whether to push the public room list to every connection.
    refresh_list: bool,
}

impl Fanout {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn snapshot(room_id: Uuid) -> Self {
        Self {
            room_snapshot: Some(room_id),
            ..Self::default()
        }
    }

    pub fn room_list() -> Self {
        Self::none().and_room_list()
    }

    pub fn and_room_list(mut self) -> Self {
        self.refresh_list = true;
        self
    }

    pub fn and_event(mut self, room_id: Uuid, envelope: ServerEnvelope) -> Self {
        self.room_events.push((room_id, envelope));
        self
    }
}

pub async fn run(state: &AppState, fanout: Fanout) {
    for (room_id, envelope) in &fanout.room_events {
        state.registry.send_room(*room_id, &envelope.encode()).await;
    }
    if let Some(room_id) = fanout.room_snapshot {
        room_update(state, room_id).await;
    }
    if fanout.refresh_list {
        room_list_update(state).await;
    }
}

/// Push a full room snapshot to the room's subscribers. A store failure
/// skips this cycle; the next state change re-broadcasts everything anyway.
pub async fn room_update(state: &AppState, room_id: Uuid) {
    let snapshot = async {
        let Some(room) = state.store.room_by_id(room_id).await? else {
            return Ok(None);
        };
        let players = state.store.players_in_room(room_id).await?;
        let messages = state.store.messages_for_room(room_id).await?;
        Ok::<_, LobbyError>(Some(ServerEnvelope::RoomUpdate {
            room,
            players,
            messages,
        }))
    }
    .await;

    match snapshot {
        Ok(Some(envelope)) => state.registry.send_room(room_id, &envelope.encode()).await,
        Ok(None) => {}
        Err(err) => warn!(%room_id, %err, "skipping room broadcast"),
    }
}

/// Push the public room list to every connected session.
pub async fn room_list_update(state: &AppState) {
    match public_room_summaries(&state.store).await {
        Ok(rooms) => {
            let envelope = ServerEnvelope::RoomListUpdate { rooms };
            state.registry.send_all(&envelope.encode()).await;
        }
        Err(err) => warn!(%err, "skipping room list broadcast"),
    }
}

/// Public waiting rooms with live player counts; shared with the HTTP list
/// endpoint.
pub async fn public_room_summaries(store: &Store) -> Result<Vec<RoomSummary>, LobbyError> {
    let rooms = store.public_rooms().await?;
    let mut summaries = Vec::with_capacity(rooms.len());
    for room in rooms {
        let player_count = store.player_count(room.id).await?;
        summaries.push(RoomSummary { room, player_count });
    }
    Ok(summaries)
}
