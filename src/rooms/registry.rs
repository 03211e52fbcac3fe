//! Live-connection sessions: who is connected, what they are called, and
//! which room/player their socket is bound to. Nothing here survives a
//! restart; rooms and players live in the store.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

pub type ConnId = Uuid;

#[derive(Debug)]
struct Session {
    username: String,
    room_id: Option<Uuid>,
    player_id: Option<Uuid>,
    tx: UnboundedSender<String>,
}

/// One entry per open socket. Binding mutations and subscriber-set reads
/// share the same lock, so a broadcast computed after a join/leave always
/// sees that join/leave.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<ConnId, Session>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conn: ConnId, tx: UnboundedSender<String>) {
        self.sessions.lock().await.insert(
            conn,
            Session {
                username: String::new(),
                room_id: None,
                player_id: None,
                tx,
            },
        );
    }

    /// Drop the session, returning its room binding if it still had one.
    pub async fn remove(&self, conn: ConnId) -> Option<(Uuid, Uuid)> {
        let session = self.sessions.lock().await.remove(&conn)?;
        Some((session.room_id?, session.player_id?))
    }

    pub async fn set_username(&self, conn: ConnId, username: &str) {
        if let Some(session) = self.sessions.lock().await.get_mut(&conn) {
            session.username = username.to_owned();
        }
    }

    pub async fn username(&self, conn: ConnId) -> Option<String> {
        self.sessions
            .lock()
            .await
            .get(&conn)
            .map(|session| session.username.clone())
    }

    pub async fn bind(&self, conn: ConnId, room_id: Uuid, player_id: Uuid) {
        if let Some(session) = self.sessions.lock().await.get_mut(&conn) {
            session.room_id = Some(room_id);
            session.player_id = Some(player_id);
        }
    }

    /// Clear the room binding, returning what it was. The second caller gets
    /// `None`, which is what makes leave-then-disconnect run removal once.
    pub async fn unbind(&self, conn: ConnId) -> Option<(Uuid, Uuid)> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&conn)?;
        let binding = (session.room_id.take()?, session.player_id.take()?);
        Some(binding)
    }

    pub async fn binding(&self, conn: ConnId) -> Option<(Uuid, Uuid)> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(&conn)?;
        Some((session.room_id?, session.player_id?))
    }

    /// A failed send means the receiver task is gone; that socket's own
    /// shutdown path handles cleanup, so it is ignored here.
    pub async fn send_to(&self, conn: ConnId, text: &str) {
        if let Some(session) = self.sessions.lock().await.get(&conn) {
            let _ = session.tx.send(text.to_owned());
        }
    }

    pub async fn send_room(&self, room_id: Uuid, text: &str) {
        for session in self.sessions.lock().await.values() {
            if session.room_id == Some(room_id) {
                let _ = session.tx.send(text.to_owned());
            }
        }
    }

    pub async fn send_all(&self, text: &str) {
        for session in self.sessions.lock().await.values() {
            let _ = session.tx.send(text.to_owned());
        }
    }
}
