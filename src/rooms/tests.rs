//! Lobby tests driven through the dispatcher: fake connections are plain
//! channel pairs registered in the registry, and every request goes through
//! the same decode/route/reply/fan-out path as a live socket.

use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use uuid::Uuid;

use crate::AppState;
use crate::rooms::broadcast::public_room_summaries;
use crate::rooms::registry::ConnId;
use crate::rooms::{lobby, ws};
use crate::store::{PlayerStatus, RoomStatus, Store};

async fn test_state() -> AppState {
    // A single connection so every query sees the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = Store::new(pool);
    store.migrate().await.unwrap();
    AppState::new(store)
}

async fn client(state: &AppState, username: &str) -> (ConnId, UnboundedReceiver<String>) {
    let conn = Uuid::now_v7();
    let (tx, rx) = mpsc::unbounded_channel();
    state.registry.register(conn, tx).await;
    send(
        state,
        conn,
        json!({"type": "connect", "payload": {"username": username}}),
    )
    .await;
    (conn, rx)
}

async fn send(state: &AppState, conn: ConnId, value: Value) {
    ws::handle_message(state, conn, &value.to_string()).await;
}

fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(text) = rx.try_recv() {
        out.push(serde_json::from_str(&text).unwrap());
    }
    out
}

fn find<'a>(messages: &'a [Value], kind: &str) -> Option<&'a Value> {
    messages.iter().find(|m| m["type"] == kind)
}

fn error_message(messages: &[Value]) -> Option<String> {
    find(messages, "error").map(|m| m["payload"]["message"].as_str().unwrap().to_owned())
}

fn uuid_of(value: &Value) -> Uuid {
    Uuid::parse_str(value.as_str().unwrap()).unwrap()
}

/// Create a room over the wire and return (room id, code, host player id).
async fn host_room(
    state: &AppState,
    conn: ConnId,
    rx: &mut UnboundedReceiver<String>,
    name: &str,
    username: &str,
    capacity: i64,
    visibility: &str,
    allow_chat: bool,
) -> (Uuid, String, Uuid) {
    send(
        state,
        conn,
        json!({"type": "create_room", "payload": {
            "name": name,
            "type": visibility,
            "capacity": capacity,
            "allowChat": allow_chat,
            "username": username,
        }}),
    )
    .await;
    let messages = drain(rx);
    let reply = find(&messages, "create_room").expect("create_room reply");
    assert_eq!(reply["payload"]["success"], true);
    (
        uuid_of(&reply["payload"]["room"]["id"]),
        reply["payload"]["room"]["code"].as_str().unwrap().to_owned(),
        uuid_of(&reply["payload"]["player"]["id"]),
    )
}

/// Join over the wire and return the new player id.
async fn join(
    state: &AppState,
    conn: ConnId,
    rx: &mut UnboundedReceiver<String>,
    code: &str,
    username: &str,
) -> Uuid {
    send(
        state,
        conn,
        json!({"type": "join_room", "payload": {"code": code, "username": username}}),
    )
    .await;
    let messages = drain(rx);
    let reply = find(&messages, "join_room").expect("join_room reply");
    assert_eq!(reply["payload"]["success"], true);
    uuid_of(&reply["payload"]["player"]["id"])
}

#[tokio::test]
async fn usernames_stay_unique_and_capacity_holds() {
    let state = test_state().await;
    let (host, mut host_rx) = client(&state, "Alice").await;
    let (room_id, code, _) =
        host_room(&state, host, &mut host_rx, "Heist", "Alice", 4, "public", true).await;

    let (bob, mut bob_rx) = client(&state, "Bob").await;
    join(&state, bob, &mut bob_rx, &code, "Bob").await;

    // Exact and case-variant collisions are both rejected.
    for dup in ["Bob", "BOB", "bob"] {
        let (conn, mut rx) = client(&state, dup).await;
        drain(&mut rx);
        send(
            &state,
            conn,
            json!({"type": "join_room", "payload": {"code": code, "username": dup}}),
        )
        .await;
        assert_eq!(
            error_message(&drain(&mut rx)).as_deref(),
            Some("Username already taken in this room")
        );
    }

    let (cara, mut cara_rx) = client(&state, "Cara").await;
    join(&state, cara, &mut cara_rx, &code, "Cara").await;
    let (dan, mut dan_rx) = client(&state, "Dan").await;
    join(&state, dan, &mut dan_rx, &code, "Dan").await;

    // Capacity 4 is now reached.
    let (eve, mut eve_rx) = client(&state, "Eve").await;
    drain(&mut eve_rx);
    send(
        &state,
        eve,
        json!({"type": "join_room", "payload": {"code": code, "username": "Eve"}}),
    )
    .await;
    assert_eq!(
        error_message(&drain(&mut eve_rx)).as_deref(),
        Some("Room is full")
    );

    let players = state.store.players_in_room(room_id).await.unwrap();
    assert_eq!(players.len(), 4);
    let mut lowered: Vec<_> = players
        .iter()
        .map(|p| p.username.to_lowercase())
        .collect();
    lowered.sort();
    lowered.dedup();
    assert_eq!(lowered.len(), 4);
}

#[tokio::test]
async fn start_game_needs_four_players_regardless_of_readiness() {
    let state = test_state().await;
    let (host, mut host_rx) = client(&state, "Alice").await;
    let (room_id, code, _) =
        host_room(&state, host, &mut host_rx, "Small", "Alice", 6, "public", true).await;

    let (bob, mut bob_rx) = client(&state, "Bob").await;
    join(&state, bob, &mut bob_rx, &code, "Bob").await;
    send(&state, bob, json!({"type": "player_ready", "payload": {"ready": true}})).await;

    drain(&mut host_rx);
    send(&state, host, json!({"type": "start_game", "payload": {}})).await;
    assert_eq!(
        error_message(&drain(&mut host_rx)).as_deref(),
        Some("Need at least 4 players to start")
    );

    let room = state.store.room_by_id(room_id).await.unwrap().unwrap();
    assert_eq!(room.status, RoomStatus::Waiting);
}

#[tokio::test]
async fn host_leave_promotes_earliest_joined_survivor() {
    let state = test_state().await;
    let (host, mut host_rx) = client(&state, "Alice").await;
    let (room_id, code, host_player) =
        host_room(&state, host, &mut host_rx, "Heist", "Alice", 6, "public", true).await;

    let (bob, mut bob_rx) = client(&state, "Bob").await;
    join(&state, bob, &mut bob_rx, &code, "Bob").await;
    let (cara, mut cara_rx) = client(&state, "Cara").await;
    join(&state, cara, &mut cara_rx, &code, "Cara").await;

    send(
        &state,
        host,
        json!({"type": "leave_room", "payload": {"playerId": host_player}}),
    )
    .await;
    let reply = drain(&mut host_rx);
    assert_eq!(find(&reply, "leave_room").unwrap()["payload"]["success"], true);

    let players = state.store.players_in_room(room_id).await.unwrap();
    assert_eq!(players.len(), 2);
    let hosts: Vec<_> = players.iter().filter(|p| p.is_host).collect();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].username, "Bob");

    let messages = state.store.messages_for_room(room_id).await.unwrap();
    assert!(messages
        .iter()
        .any(|m| m.is_system && m.content == "Bob is now the host"));
}

#[tokio::test]
async fn last_leave_deletes_room_and_messages() {
    let state = test_state().await;
    let (host, mut host_rx) = client(&state, "Alice").await;
    let (room_id, code, host_player) =
        host_room(&state, host, &mut host_rx, "Lonely", "Alice", 4, "public", true).await;

    send(
        &state,
        host,
        json!({"type": "leave_room", "payload": {"playerId": host_player}}),
    )
    .await;

    assert!(state.store.room_by_code(&code).await.unwrap().is_none());
    assert!(state
        .store
        .messages_for_room(room_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn ready_toggle_round_trip_restores_player_state() {
    let state = test_state().await;
    let (host, mut host_rx) = client(&state, "Alice").await;
    let (room_id, code, _) =
        host_room(&state, host, &mut host_rx, "Toggle", "Alice", 4, "public", true).await;

    let (bob, mut bob_rx) = client(&state, "Bob").await;
    let bob_player = join(&state, bob, &mut bob_rx, &code, "Bob").await;

    let before = state
        .store
        .players_in_room(room_id)
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.id == bob_player)
        .unwrap();

    send(&state, bob, json!({"type": "player_ready", "payload": {"ready": true}})).await;
    let ready = state
        .store
        .players_in_room(room_id)
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.id == bob_player)
        .unwrap();
    assert_eq!(ready.status, PlayerStatus::Ready);

    send(&state, bob, json!({"type": "player_ready", "payload": {"ready": false}})).await;
    let after = state
        .store
        .players_in_room(room_id)
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.id == bob_player)
        .unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn heist_scenario_starts_and_leaves_the_listing() {
    let state = test_state().await;
    let (alice, mut alice_rx) = client(&state, "Alice").await;
    let (room_id, code, _) =
        host_room(&state, alice, &mut alice_rx, "Heist", "Alice", 4, "public", true).await;

    let (bob, mut bob_rx) = client(&state, "Bob").await;
    join(&state, bob, &mut bob_rx, &code, "Bob").await;
    let (cara, mut cara_rx) = client(&state, "Cara").await;
    join(&state, cara, &mut cara_rx, &code, "Cara").await;
    let (dan, mut dan_rx) = client(&state, "Dan").await;
    join(&state, dan, &mut dan_rx, &code, "Dan").await;

    for conn in [bob, cara, dan] {
        send(&state, conn, json!({"type": "player_ready", "payload": {"ready": true}})).await;
    }
    for rx in [&mut alice_rx, &mut bob_rx, &mut cara_rx, &mut dan_rx] {
        drain(rx);
    }

    send(&state, alice, json!({"type": "start_game", "payload": {}})).await;

    let room = state.store.room_by_id(room_id).await.unwrap().unwrap();
    assert_eq!(room.status, RoomStatus::Started);

    for rx in [&mut alice_rx, &mut bob_rx, &mut cara_rx, &mut dan_rx] {
        let messages = drain(rx);
        let start = find(&messages, "start_game").expect("start_game broadcast");
        assert_eq!(start["payload"]["started"], true);
        // Everyone also gets the refreshed listing, without the started room.
        let listing = find(&messages, "room_list_update").expect("room list refresh");
        assert!(listing["payload"]["rooms"]
            .as_array()
            .unwrap()
            .iter()
            .all(|r| r["code"] != code.as_str()));
    }

    let listed = public_room_summaries(&state.store).await.unwrap();
    assert!(listed.iter().all(|summary| summary.room.id != room_id));
}

#[tokio::test]
async fn unknown_code_join_errors_without_broadcast() {
    let state = test_state().await;
    let (joiner, mut joiner_rx) = client(&state, "Alice").await;
    let (bystander, mut bystander_rx) = client(&state, "Bob").await;
    let _ = bystander;
    drain(&mut joiner_rx);
    drain(&mut bystander_rx);

    send(
        &state,
        joiner,
        json!({"type": "join_room", "payload": {"code": "ZZZZZZ", "username": "Alice"}}),
    )
    .await;

    assert_eq!(
        error_message(&drain(&mut joiner_rx)).as_deref(),
        Some("Room not found")
    );
    assert!(drain(&mut bystander_rx).is_empty());
}

#[tokio::test]
async fn last_slot_race_admits_exactly_one() {
    let state = test_state().await;
    let (host, mut host_rx) = client(&state, "Alice").await;
    let (room_id, code, _) =
        host_room(&state, host, &mut host_rx, "Race", "Alice", 4, "public", true).await;

    let (bob, mut bob_rx) = client(&state, "Bob").await;
    join(&state, bob, &mut bob_rx, &code, "Bob").await;
    let (cara, mut cara_rx) = client(&state, "Cara").await;
    join(&state, cara, &mut cara_rx, &code, "Cara").await;

    let (dan, mut dan_rx) = client(&state, "Dan").await;
    let (eve, mut eve_rx) = client(&state, "Eve").await;
    drain(&mut dan_rx);
    drain(&mut eve_rx);

    tokio::join!(
        send(
            &state,
            dan,
            json!({"type": "join_room", "payload": {"code": code, "username": "Dan"}}),
        ),
        send(
            &state,
            eve,
            json!({"type": "join_room", "payload": {"code": code, "username": "Eve"}}),
        ),
    );

    let dan_messages = drain(&mut dan_rx);
    let eve_messages = drain(&mut eve_rx);
    let dan_joined = find(&dan_messages, "join_room").is_some();
    let eve_joined = find(&eve_messages, "join_room").is_some();
    assert!(dan_joined != eve_joined, "exactly one join must win");

    let loser_messages = if dan_joined { &eve_messages } else { &dan_messages };
    assert_eq!(
        error_message(loser_messages).as_deref(),
        Some("Room is full")
    );
    assert_eq!(state.store.player_count(room_id).await.unwrap(), 4);
}

#[tokio::test]
async fn chat_reaches_room_subscribers_only() {
    let state = test_state().await;
    let (host, mut host_rx) = client(&state, "Alice").await;
    let (_room_id, code, _) =
        host_room(&state, host, &mut host_rx, "Chatty", "Alice", 4, "public", true).await;

    let (bob, mut bob_rx) = client(&state, "Bob").await;
    join(&state, bob, &mut bob_rx, &code, "Bob").await;
    let (outsider, mut outsider_rx) = client(&state, "Eve").await;
    let _ = outsider;
    drain(&mut host_rx);
    drain(&mut outsider_rx);

    send(
        &state,
        bob,
        json!({"type": "chat_message", "payload": {"content": "ready when you are"}}),
    )
    .await;

    let host_messages = drain(&mut host_rx);
    let chat = find(&host_messages, "chat_message").expect("chat broadcast");
    assert_eq!(chat["payload"]["message"]["content"], "ready when you are");
    assert_eq!(chat["payload"]["message"]["senderName"], "Bob");
    assert_eq!(chat["payload"]["message"]["isSystem"], false);
    assert!(drain(&mut outsider_rx).is_empty());
}

#[tokio::test]
async fn chat_is_rejected_when_room_disallows_it() {
    let state = test_state().await;
    let (host, mut host_rx) = client(&state, "Alice").await;
    host_room(&state, host, &mut host_rx, "Quiet", "Alice", 4, "public", false).await;

    send(
        &state,
        host,
        json!({"type": "chat_message", "payload": {"content": "anyone?"}}),
    )
    .await;
    assert_eq!(
        error_message(&drain(&mut host_rx)).as_deref(),
        Some("Chat is disabled in this room")
    );
}

#[tokio::test]
async fn only_the_host_changes_settings_and_listing_follows() {
    let state = test_state().await;
    let (host, mut host_rx) = client(&state, "Alice").await;
    let (room_id, code, _) =
        host_room(&state, host, &mut host_rx, "Flip", "Alice", 4, "public", true).await;

    let (bob, mut bob_rx) = client(&state, "Bob").await;
    join(&state, bob, &mut bob_rx, &code, "Bob").await;

    send(
        &state,
        bob,
        json!({"type": "update_room_settings", "payload": {
            "roomId": room_id, "settings": {"type": "private"}
        }}),
    )
    .await;
    assert_eq!(
        error_message(&drain(&mut bob_rx)).as_deref(),
        Some("Only the host can change room settings")
    );

    let (watcher, mut watcher_rx) = client(&state, "Watcher").await;
    let _ = watcher;
    drain(&mut watcher_rx);

    send(
        &state,
        host,
        json!({"type": "update_room_settings", "payload": {
            "roomId": room_id, "settings": {"type": "private"}
        }}),
    )
    .await;
    let host_messages = drain(&mut host_rx);
    let reply = find(&host_messages, "update_room_settings").expect("settings reply");
    assert_eq!(reply["payload"]["room"]["type"], "private");

    // The now-private room must vanish from everyone's listing.
    let watcher_messages = drain(&mut watcher_rx);
    let listing = find(&watcher_messages, "room_list_update").expect("room list refresh");
    assert!(listing["payload"]["rooms"].as_array().unwrap().is_empty());

    let room = state.store.room_by_id(room_id).await.unwrap().unwrap();
    assert_eq!(room.visibility, crate::store::RoomVisibility::Private);
}

#[tokio::test]
async fn disconnect_runs_the_leave_path_exactly_once() {
    let state = test_state().await;
    let (host, mut host_rx) = client(&state, "Alice").await;
    let (room_id, code, _) =
        host_room(&state, host, &mut host_rx, "Drop", "Alice", 4, "public", true).await;

    let (bob, mut bob_rx) = client(&state, "Bob").await;
    join(&state, bob, &mut bob_rx, &code, "Bob").await;

    lobby::disconnect(&state, bob).await;
    lobby::disconnect(&state, bob).await;

    let players = state.store.players_in_room(room_id).await.unwrap();
    assert_eq!(players.len(), 1);
    assert_eq!(players[0].username, "Alice");

    let messages = state.store.messages_for_room(room_id).await.unwrap();
    let departures = messages
        .iter()
        .filter(|m| m.is_system && m.content == "Bob has left the room")
        .count();
    assert_eq!(departures, 1);
}

#[tokio::test]
async fn leave_then_disconnect_does_not_remove_twice() {
    let state = test_state().await;
    let (host, mut host_rx) = client(&state, "Alice").await;
    let (room_id, code, _) =
        host_room(&state, host, &mut host_rx, "Clean", "Alice", 4, "public", true).await;

    let (bob, mut bob_rx) = client(&state, "Bob").await;
    let bob_player = join(&state, bob, &mut bob_rx, &code, "Bob").await;

    send(
        &state,
        bob,
        json!({"type": "leave_room", "payload": {"playerId": bob_player}}),
    )
    .await;
    lobby::disconnect(&state, bob).await;

    let messages = state.store.messages_for_room(room_id).await.unwrap();
    let departures = messages
        .iter()
        .filter(|m| m.is_system && m.content == "Bob has left the room")
        .count();
    assert_eq!(departures, 1);
    assert_eq!(state.store.player_count(room_id).await.unwrap(), 1);
}

#[tokio::test]
async fn started_rooms_reject_new_joins() {
    let state = test_state().await;
    let (alice, mut alice_rx) = client(&state, "Alice").await;
    let (_room_id, code, _) =
        host_room(&state, alice, &mut alice_rx, "Going", "Alice", 4, "public", true).await;

    let mut receivers = Vec::new();
    for name in ["Bob", "Cara", "Dan"] {
        let (conn, mut rx) = client(&state, name).await;
        join(&state, conn, &mut rx, &code, name).await;
        send(&state, conn, json!({"type": "player_ready", "payload": {"ready": true}})).await;
        receivers.push(rx);
    }
    send(&state, alice, json!({"type": "start_game", "payload": {}})).await;

    let (late, mut late_rx) = client(&state, "Late").await;
    drain(&mut late_rx);
    send(
        &state,
        late,
        json!({"type": "join_room", "payload": {"code": code, "username": "Late"}}),
    )
    .await;
    assert_eq!(
        error_message(&drain(&mut late_rx)).as_deref(),
        Some("Game has already started")
    );
}

#[tokio::test]
async fn unknown_and_malformed_messages_answer_the_sender_only() {
    let state = test_state().await;
    let (conn, mut rx) = client(&state, "Alice").await;
    let (other, mut other_rx) = client(&state, "Bob").await;
    let _ = other;
    drain(&mut rx);
    drain(&mut other_rx);

    send(&state, conn, json!({"type": "warp_speed", "payload": {}})).await;
    assert_eq!(
        error_message(&drain(&mut rx)).as_deref(),
        Some("Unknown message type")
    );

    send(&state, conn, json!({"type": "join_room", "payload": {"code": 7}})).await;
    assert_eq!(
        error_message(&drain(&mut rx)).as_deref(),
        Some("Failed to process message")
    );

    assert!(drain(&mut other_rx).is_empty());
}
