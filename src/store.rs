use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::LobbyError;
use crate::rooms::code;

/// Sender name used for server-authored chat messages.
pub const SYSTEM_SENDER: &str = "SYSTEM";

/// Room snapshots carry at most this many recent messages.
pub const MESSAGE_HISTORY_LIMIT: i64 = 50;

/// Upper bound on any single storage call; an elapsed timeout surfaces as
/// `LobbyError::StoreTimeout` instead of hanging the connection.
const STORE_TIMEOUT: Duration = Duration::from_secs(5);

const CODE_ATTEMPTS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RoomVisibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Started,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PlayerStatus {
    Waiting,
    Ready,
    Playing,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub visibility: RoomVisibility,
    pub capacity: i64,
    pub allow_chat: bool,
    pub status: RoomStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: Uuid,
    pub room_id: Uuid,
    pub username: String,
    pub status: PlayerStatus,
    pub is_host: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_name: String,
    pub content: String,
    pub is_system: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
}

/// A public-listing entry; `player_count` is derived per query, never stored.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    #[serde(flatten)]
    pub room: Room,
    pub player_count: i64,
}

/// Repository over SQLite. The only seam to persistence: rooms, players and
/// messages go through here, nothing else touches the pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

async fn bounded<T>(fut: impl Future<Output = Result<T, sqlx::Error>>) -> Result<T, LobbyError> {
    match tokio::time::timeout(STORE_TIMEOUT, fut).await {
        Ok(result) => result.map_err(LobbyError::Store),
        Err(_) => Err(LobbyError::StoreTimeout),
    }
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), LobbyError> {
        bounded(async {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS rooms (
                    id BLOB PRIMARY KEY,
                    code TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    visibility TEXT NOT NULL,
                    capacity INTEGER NOT NULL,
                    allow_chat INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS players (
                    id BLOB PRIMARY KEY,
                    room_id BLOB NOT NULL,
                    username TEXT NOT NULL,
                    status TEXT NOT NULL,
                    is_host INTEGER NOT NULL,
                    joined_at TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await?;
            sqlx::query("CREATE INDEX IF NOT EXISTS players_by_room ON players (room_id)")
                .execute(&self.pool)
                .await?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS messages (
                    id BLOB PRIMARY KEY,
                    room_id BLOB NOT NULL,
                    sender_name TEXT NOT NULL,
                    content TEXT NOT NULL,
                    is_system INTEGER NOT NULL,
                    sent_at TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await?;
            sqlx::query("CREATE INDEX IF NOT EXISTS messages_by_room ON messages (room_id)")
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    // -- rooms --

    /// Insert a room with a freshly generated code, retrying on the rare
    /// collision with an existing code (unique index on `code`).
    pub async fn create_room(
        &self,
        name: &str,
        visibility: RoomVisibility,
        capacity: i64,
        allow_chat: bool,
    ) -> Result<Room, LobbyError> {
        for _ in 0..CODE_ATTEMPTS {
            let room = Room {
                id: Uuid::now_v7(),
                code: code::generate(),
                name: name.to_owned(),
                visibility,
                capacity,
                allow_chat,
                status: RoomStatus::Waiting,
                created_at: OffsetDateTime::now_utc(),
            };
            let inserted = bounded(
                sqlx::query(
                    "INSERT INTO rooms (id, code, name, visibility, capacity, allow_chat, status, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(room.id)
                .bind(&room.code)
                .bind(&room.name)
                .bind(room.visibility)
                .bind(room.capacity)
                .bind(room.allow_chat)
                .bind(room.status)
                .bind(room.created_at)
                .execute(&self.pool),
            )
            .await;
            match inserted {
                Ok(_) => return Ok(room),
                Err(LobbyError::Store(sqlx::Error::Database(db))) if db.is_unique_violation() => {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(LobbyError::CodeExhausted)
    }

    /// Codes are compared case-insensitively and stored uppercase.
    pub async fn room_by_code(&self, code: &str) -> Result<Option<Room>, LobbyError> {
        let code = code::normalize(code);
        bounded(
            sqlx::query_as::<_, Room>(
                "SELECT id, code, name, visibility, capacity, allow_chat, status, created_at
                 FROM rooms WHERE code = ?",
            )
            .bind(code)
            .fetch_optional(&self.pool),
        )
        .await
    }

    pub async fn room_by_id(&self, id: Uuid) -> Result<Option<Room>, LobbyError> {
        bounded(
            sqlx::query_as::<_, Room>(
                "SELECT id, code, name, visibility, capacity, allow_chat, status, created_at
                 FROM rooms WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool),
        )
        .await
    }

    /// Public rooms still in the lobby; started rooms drop out of listings.
    pub async fn public_rooms(&self) -> Result<Vec<Room>, LobbyError> {
        bounded(
            sqlx::query_as::<_, Room>(
                "SELECT id, code, name, visibility, capacity, allow_chat, status, created_at
                 FROM rooms WHERE visibility = ? AND status = ?
                 ORDER BY created_at, id",
            )
            .bind(RoomVisibility::Public)
            .bind(RoomStatus::Waiting)
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn update_room_status(
        &self,
        id: Uuid,
        status: RoomStatus,
    ) -> Result<Option<Room>, LobbyError> {
        bounded(async {
            sqlx::query("UPDATE rooms SET status = ? WHERE id = ?")
                .bind(status)
                .bind(id)
                .execute(&self.pool)
                .await?;
            sqlx::query_as::<_, Room>(
                "SELECT id, code, name, visibility, capacity, allow_chat, status, created_at
                 FROM rooms WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
        })
        .await
    }

    pub async fn update_room_visibility(
        &self,
        id: Uuid,
        visibility: RoomVisibility,
    ) -> Result<Option<Room>, LobbyError> {
        bounded(async {
            sqlx::query("UPDATE rooms SET visibility = ? WHERE id = ?")
                .bind(visibility)
                .bind(id)
                .execute(&self.pool)
                .await?;
            sqlx::query_as::<_, Room>(
                "SELECT id, code, name, visibility, capacity, allow_chat, status, created_at
                 FROM rooms WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
        })
        .await
    }

    /// Delete a room together with its players and messages.
    pub async fn delete_room(&self, id: Uuid) -> Result<bool, LobbyError> {
        bounded(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM messages WHERE room_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM players WHERE room_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            let deleted = sqlx::query("DELETE FROM rooms WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(deleted.rows_affected() > 0)
        })
        .await
    }

    // -- players --

    pub async fn add_player(
        &self,
        room_id: Uuid,
        username: &str,
        is_host: bool,
    ) -> Result<Player, LobbyError> {
        let player = Player {
            id: Uuid::now_v7(),
            room_id,
            username: username.to_owned(),
            status: PlayerStatus::Waiting,
            is_host,
            joined_at: OffsetDateTime::now_utc(),
        };
        bounded(
            sqlx::query(
                "INSERT INTO players (id, room_id, username, status, is_host, joined_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(player.id)
            .bind(player.room_id)
            .bind(&player.username)
            .bind(player.status)
            .bind(player.is_host)
            .bind(player.joined_at)
            .execute(&self.pool),
        )
        .await?;
        Ok(player)
    }

    /// Players in join order; the first entry is next in line for host.
    pub async fn players_in_room(&self, room_id: Uuid) -> Result<Vec<Player>, LobbyError> {
        bounded(
            sqlx::query_as::<_, Player>(
                "SELECT id, room_id, username, status, is_host, joined_at
                 FROM players WHERE room_id = ? ORDER BY joined_at, id",
            )
            .bind(room_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn player_count(&self, room_id: Uuid) -> Result<i64, LobbyError> {
        bounded(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM players WHERE room_id = ?")
                .bind(room_id)
                .fetch_one(&self.pool),
        )
        .await
    }

    /// Case-insensitive username lookup within one room.
    pub async fn player_by_username(
        &self,
        room_id: Uuid,
        username: &str,
    ) -> Result<Option<Player>, LobbyError> {
        bounded(
            sqlx::query_as::<_, Player>(
                "SELECT id, room_id, username, status, is_host, joined_at
                 FROM players WHERE room_id = ? AND username = ? COLLATE NOCASE",
            )
            .bind(room_id)
            .bind(username)
            .fetch_optional(&self.pool),
        )
        .await
    }

    pub async fn update_player_status(
        &self,
        id: Uuid,
        status: PlayerStatus,
    ) -> Result<Option<Player>, LobbyError> {
        bounded(async {
            sqlx::query("UPDATE players SET status = ? WHERE id = ?")
                .bind(status)
                .bind(id)
                .execute(&self.pool)
                .await?;
            sqlx::query_as::<_, Player>(
                "SELECT id, room_id, username, status, is_host, joined_at
                 FROM players WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
        })
        .await
    }

    pub async fn set_host(&self, id: Uuid) -> Result<(), LobbyError> {
        bounded(async {
            sqlx::query("UPDATE players SET is_host = 1 WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn remove_player(&self, id: Uuid) -> Result<bool, LobbyError> {
        bounded(async {
            let deleted = sqlx::query("DELETE FROM players WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(deleted.rows_affected() > 0)
        })
        .await
    }

    // -- messages --

    pub async fn add_message(
        &self,
        room_id: Uuid,
        sender_name: &str,
        content: &str,
        is_system: bool,
    ) -> Result<Message, LobbyError> {
        let message = Message {
            id: Uuid::now_v7(),
            room_id,
            sender_name: sender_name.to_owned(),
            content: content.to_owned(),
            is_system,
            sent_at: OffsetDateTime::now_utc(),
        };
        bounded(
            sqlx::query(
                "INSERT INTO messages (id, room_id, sender_name, content, is_system, sent_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(message.id)
            .bind(message.room_id)
            .bind(&message.sender_name)
            .bind(&message.content)
            .bind(message.is_system)
            .bind(message.sent_at)
            .execute(&self.pool),
        )
        .await?;
        Ok(message)
    }

    pub async fn add_system_message(
        &self,
        room_id: Uuid,
        content: &str,
    ) -> Result<Message, LobbyError> {
        self.add_message(room_id, SYSTEM_SENDER, content, true).await
    }

    /// The most recent messages for a room, oldest first.
    pub async fn messages_for_room(&self, room_id: Uuid) -> Result<Vec<Message>, LobbyError> {
        let mut messages = bounded(
            sqlx::query_as::<_, Message>(
                "SELECT id, room_id, sender_name, content, is_system, sent_at
                 FROM messages WHERE room_id = ?
                 ORDER BY sent_at DESC, id DESC LIMIT ?",
            )
            .bind(room_id)
            .bind(MESSAGE_HISTORY_LIMIT)
            .fetch_all(&self.pool),
        )
        .await?;
        messages.reverse();
        Ok(messages)
    }
}
