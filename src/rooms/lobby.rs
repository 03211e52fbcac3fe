//! The room lifecycle engine: create, join, leave, ready, start, settings.
//!
//! Every operation returns the reply envelope for the sender plus the
//! [`Fanout`] it triggers. Check-then-act sequences on one room (capacity,
//! username uniqueness, host checks) run under that room's lock; operations
//! on different rooms proceed independently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::error::LobbyError;
use crate::rooms::broadcast::{self, Fanout};
use crate::rooms::protocol::{self, ServerEnvelope};
use crate::rooms::registry::ConnId;
use crate::store::{PlayerStatus, RoomStatus, RoomVisibility};

pub const MIN_PLAYERS_TO_START: usize = 4;
pub const MIN_CAPACITY: i64 = 4;
pub const MAX_CAPACITY: i64 = 12;

/// Per-room mutual exclusion, keyed by room id. Entries are created on
/// demand and dropped when the room is deleted.
#[derive(Debug, Default)]
pub struct RoomLocks {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl RoomLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, room_id: Uuid) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.inner.lock().await;
            Arc::clone(locks.entry(room_id).or_default())
        };
        entry.lock_owned().await
    }

    pub async fn release(&self, room_id: Uuid) {
        self.inner.lock().await.remove(&room_id);
    }
}

pub async fn connect(
    state: &AppState,
    conn: ConnId,
    msg: protocol::Connect,
) -> Result<(ServerEnvelope, Fanout), LobbyError> {
    state.registry.set_username(conn, &msg.username).await;
    debug!(%conn, username = %msg.username, "session named");
    let reply = ServerEnvelope::Connect {
        username: msg.username,
        connected: true,
    };
    Ok((reply, Fanout::room_list()))
}

pub async fn create_room(
    state: &AppState,
    conn: ConnId,
    msg: protocol::CreateRoom,
) -> Result<(ServerEnvelope, Fanout), LobbyError> {
    let capacity = msg.capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
    let room = state
        .store
        .create_room(&msg.name, msg.visibility, capacity, msg.allow_chat)
        .await?;
    let player = state.store.add_player(room.id, &msg.username, true).await?;
    state.registry.set_username(conn, &msg.username).await;
    state.registry.bind(conn, room.id, player.id).await;
    state
        .store
        .add_system_message(
            room.id,
            &format!("Room \"{}\" created by {}", room.name, msg.username),
        )
        .await?;
    info!(code = %room.code, host = %msg.username, "room created");

    let fanout = if room.visibility == RoomVisibility::Public {
        Fanout::room_list()
    } else {
        Fanout::none()
    };
    let reply = ServerEnvelope::CreateRoom {
        room,
        player,
        success: true,
    };
    Ok((reply, fanout))
}

pub async fn join_room(
    state: &AppState,
    conn: ConnId,
    msg: protocol::JoinRoom,
) -> Result<(ServerEnvelope, Fanout), LobbyError> {
    let room = state
        .store
        .room_by_code(&msg.code)
        .await?
        .ok_or(LobbyError::RoomNotFound)?;

    let _guard = state.locks.acquire(room.id).await;
    // Re-read under the lock; the room may have started or emptied out
    // between lookup and lock.
    let room = state
        .store
        .room_by_id(room.id)
        .await?
        .ok_or(LobbyError::RoomNotFound)?;
    if room.status != RoomStatus::Waiting {
        return Err(LobbyError::AlreadyStarted);
    }
    if state
        .store
        .player_by_username(room.id, &msg.username)
        .await?
        .is_some()
    {
        return Err(LobbyError::NameTaken);
    }
    if state.store.player_count(room.id).await? >= room.capacity {
        return Err(LobbyError::RoomFull);
    }

    let player = state.store.add_player(room.id, &msg.username, false).await?;
    state.registry.set_username(conn, &msg.username).await;
    state.registry.bind(conn, room.id, player.id).await;
    state
        .store
        .add_system_message(room.id, &format!("{} has joined the room", msg.username))
        .await?;
    info!(code = %room.code, username = %msg.username, "player joined");

    let players = state.store.players_in_room(room.id).await?;
    let messages = state.store.messages_for_room(room.id).await?;
    let fanout = Fanout::snapshot(room.id);
    let reply = ServerEnvelope::JoinRoom {
        room,
        players,
        player,
        messages,
        success: true,
    };
    Ok((reply, fanout))
}

pub async fn leave_room(
    state: &AppState,
    conn: ConnId,
    _msg: protocol::LeaveRoom,
) -> Result<(ServerEnvelope, Fanout), LobbyError> {
    let (room_id, player_id) = state
        .registry
        .binding(conn)
        .await
        .ok_or(LobbyError::NotInRoom)?;
    let fanout = remove_player(state, room_id, player_id).await?;
    state.registry.unbind(conn).await;
    Ok((ServerEnvelope::LeaveRoom { success: true }, fanout))
}

/// Transport close. Clears the session first (the socket must not receive
/// anything further), then runs the same removal path as an explicit leave.
/// A connection that already left cleanly has no binding, so removal runs
/// at most once.
pub async fn disconnect(state: &AppState, conn: ConnId) {
    let binding = state.registry.remove(conn).await;
    if let Some((room_id, player_id)) = binding {
        match remove_player(state, room_id, player_id).await {
            Ok(fanout) => broadcast::run(state, fanout).await,
            Err(err) => warn!(%conn, %err, "disconnect cleanup failed"),
        }
    }
}

/// Shared removal path for leave and disconnect: delete the player, hand
/// the room to the earliest-joined survivor if the host left, delete the
/// room when it empties.
async fn remove_player(
    state: &AppState,
    room_id: Uuid,
    player_id: Uuid,
) -> Result<Fanout, LobbyError> {
    let _guard = state.locks.acquire(room_id).await;
    let Some(room) = state.store.room_by_id(room_id).await? else {
        return Ok(Fanout::none());
    };
    let players = state.store.players_in_room(room_id).await?;
    let Some(player) = players.iter().find(|p| p.id == player_id).cloned() else {
        return Ok(Fanout::none());
    };

    state.store.remove_player(player_id).await?;
    state
        .store
        .add_system_message(room_id, &format!("{} has left the room", player.username))
        .await?;

    let remaining: Vec<_> = players.into_iter().filter(|p| p.id != player_id).collect();
    if remaining.is_empty() {
        state.store.delete_room(room_id).await?;
        state.locks.release(room_id).await;
        info!(code = %room.code, "room emptied and deleted");
        return Ok(if room.visibility == RoomVisibility::Public {
            Fanout::room_list()
        } else {
            Fanout::none()
        });
    }

    if player.is_host {
        // players_in_room is join-ordered, so the first survivor takes over.
        let new_host = &remaining[0];
        state.store.set_host(new_host.id).await?;
        state
            .store
            .add_system_message(room_id, &format!("{} is now the host", new_host.username))
            .await?;
        info!(code = %room.code, username = %new_host.username, "host migrated");
    }

    let fanout = Fanout::snapshot(room_id);
    Ok(if room.visibility == RoomVisibility::Public {
        fanout.and_room_list()
    } else {
        fanout
    })
}

pub async fn chat_message(
    state: &AppState,
    conn: ConnId,
    msg: protocol::ChatMessage,
) -> Result<(ServerEnvelope, Fanout), LobbyError> {
    let (room_id, _player_id) = state
        .registry
        .binding(conn)
        .await
        .ok_or(LobbyError::NotInRoom)?;
    let room = state
        .store
        .room_by_id(room_id)
        .await?
        .ok_or(LobbyError::RoomNotFound)?;
    if !room.allow_chat {
        return Err(LobbyError::ChatDisabled);
    }
    let username = state
        .registry
        .username(conn)
        .await
        .ok_or(LobbyError::NotInRoom)?;

    let message = state
        .store
        .add_message(room_id, &username, &msg.content, false)
        .await?;
    let envelope = ServerEnvelope::ChatMessage { message };
    let fanout = Fanout::none().and_event(room_id, envelope.clone());
    Ok((envelope, fanout))
}

pub async fn player_ready(
    state: &AppState,
    conn: ConnId,
    msg: protocol::PlayerReady,
) -> Result<(ServerEnvelope, Fanout), LobbyError> {
    let (room_id, player_id) = state
        .registry
        .binding(conn)
        .await
        .ok_or(LobbyError::NotInRoom)?;
    let status = if msg.ready {
        PlayerStatus::Ready
    } else {
        PlayerStatus::Waiting
    };
    let player = state
        .store
        .update_player_status(player_id, status)
        .await?
        .ok_or(LobbyError::NotInRoom)?;

    let reply = ServerEnvelope::PlayerReady {
        player,
        success: true,
    };
    Ok((reply, Fanout::snapshot(room_id)))
}

pub async fn start_game(
    state: &AppState,
    conn: ConnId,
) -> Result<(ServerEnvelope, Fanout), LobbyError> {
    let (room_id, player_id) = state
        .registry
        .binding(conn)
        .await
        .ok_or(LobbyError::NotInRoom)?;

    let _guard = state.locks.acquire(room_id).await;
    let room = state
        .store
        .room_by_id(room_id)
        .await?
        .ok_or(LobbyError::RoomNotFound)?;
    let players = state.store.players_in_room(room_id).await?;
    let caller = players
        .iter()
        .find(|p| p.id == player_id)
        .ok_or(LobbyError::NotInRoom)?;

    if !caller.is_host {
        return Err(LobbyError::NotHost("start the game"));
    }
    if room.status != RoomStatus::Waiting {
        return Err(LobbyError::AlreadyStarted);
    }
    if players.len() < MIN_PLAYERS_TO_START {
        return Err(LobbyError::NotEnoughPlayers(MIN_PLAYERS_TO_START));
    }
    // The host is implicitly eligible; everyone else must have readied up.
    if !players
        .iter()
        .all(|p| p.is_host || p.status == PlayerStatus::Ready)
    {
        return Err(LobbyError::NotAllReady);
    }

    state
        .store
        .update_room_status(room_id, RoomStatus::Started)
        .await?;
    state
        .store
        .add_system_message(room_id, "Game has started!")
        .await?;
    info!(code = %room.code, "game started");

    let envelope = ServerEnvelope::StartGame { started: true };
    let fanout = Fanout::none()
        .and_event(room_id, envelope.clone())
        .and_room_list();
    Ok((envelope, fanout))
}

pub async fn update_room_settings(
    state: &AppState,
    conn: ConnId,
    msg: protocol::UpdateRoomSettings,
) -> Result<(ServerEnvelope, Fanout), LobbyError> {
    let (room_id, player_id) = state
        .registry
        .binding(conn)
        .await
        .ok_or(LobbyError::NotInRoom)?;

    let _guard = state.locks.acquire(room_id).await;
    let mut room = state
        .store
        .room_by_id(room_id)
        .await?
        .ok_or(LobbyError::RoomNotFound)?;
    let players = state.store.players_in_room(room_id).await?;
    let caller = players
        .iter()
        .find(|p| p.id == player_id)
        .ok_or(LobbyError::NotInRoom)?;
    if !caller.is_host {
        return Err(LobbyError::NotHost("change room settings"));
    }

    let mut fanout = Fanout::none();
    if let Some(visibility) = msg.settings.visibility {
        if visibility != room.visibility {
            room = state
                .store
                .update_room_visibility(room_id, visibility)
                .await?
                .ok_or(LobbyError::RoomNotFound)?;
            let label = match visibility {
                RoomVisibility::Public => "public",
                RoomVisibility::Private => "private",
            };
            state
                .store
                .add_system_message(room_id, &format!("Room is now {label}"))
                .await?;
            info!(code = %room.code, visibility = label, "room visibility changed");
            // Either direction of the toggle changes the public listing.
            fanout = Fanout::snapshot(room_id).and_room_list();
        }
    }

    let reply = ServerEnvelope::UpdateRoomSettings {
        room,
        success: true,
    };
    Ok((reply, fanout))
}
