//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scribe_collab::client::{ConnectionState, SyncClient, SyncEvent};
use scribe_collab::config::ServerConfig;
use scribe_collab::presence::{CursorPosition, UserColor};
use scribe_collab::protocol::{ClientMessage, Codec, RejectReason, ServerMessage};
use scribe_collab::server::SyncServer;
use scribe_core::Operation;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Start a server on a free port; returns its URL and a handle for
/// inspecting it.
async fn start_test_server(initial_text: &str) -> (String, Arc<SyncServer>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        initial_text: initial_text.to_string(),
        ..ServerConfig::default()
    }));
    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (format!("ws://127.0.0.1:{port}"), server)
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for(
    events: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn joined_client(url: &str, name: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(name, "doc", url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Joined { .. })).await;
    (client, events)
}

/// Poll until every client has seen `version` with nothing in flight.
async fn settle(clients: &[&SyncClient], version: u64) {
    for _ in 0..100 {
        let mut done = true;
        for client in clients {
            done &= client.version().await == Some(version) && !client.has_pending().await;
        }
        if done {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("clients did not settle at version {version}");
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, _server) = start_test_server("").await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_connects_and_receives_snapshot() {
    let (url, _server) = start_test_server("Hello").await;
    let mut client = SyncClient::new("Alice", "doc", &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    assert_eq!(
        timeout(Duration::from_secs(2), events.recv()).await.unwrap(),
        Some(SyncEvent::Connected)
    );
    match wait_for(&mut events, |e| matches!(e, SyncEvent::Joined { .. })).await {
        SyncEvent::Joined { version, users, .. } => {
            assert_eq!(version, 0);
            assert_eq!(users, vec!["Alice".to_string()]);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.text().await.as_deref(), Some("Hello"));
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_two_clients_converge() {
    let (url, server) = start_test_server("Hello").await;
    let (alice, _alice_events) = joined_client(&url, "Alice").await;
    let (bob, _bob_events) = joined_client(&url, "Bob").await;

    alice.insert(0, "X").await.unwrap();
    bob.edit(|doc| {
        let end = doc.content().len();
        Operation::insert_at(doc.room_id(), doc.client_id(), doc.version(), end, end, "Y")
    })
    .await
    .unwrap();

    settle(&[&alice, &bob], 2).await;
    assert_eq!(alice.text().await.as_deref(), Some("XHelloY"));
    assert_eq!(bob.text().await.as_deref(), Some("XHelloY"));

    let room = server.registry().room("doc").await.unwrap();
    assert_eq!(room.inspect(|s| s.document().content().text()).await, "XHelloY");

    let stats = server.stats().await;
    assert_eq!(stats.commits, 2);
    assert_eq!(stats.active_rooms, 1);
    assert!(stats.total_connections >= 2);
}

#[tokio::test]
async fn test_rapid_typing_converges() {
    let (url, _server) = start_test_server("|").await;
    let (alice, _alice_events) = joined_client(&url, "Alice").await;
    let (bob, _bob_events) = joined_client(&url, "Bob").await;

    for ch in ["a", "b", "c", "d", "e"] {
        alice
            .edit(|doc| {
                let end = doc.content().len();
                Operation::insert_at(doc.room_id(), doc.client_id(), doc.version(), end, end, ch)
            })
            .await
            .unwrap();
        bob.insert(0, "z").await.unwrap();
    }

    // Buffered edits compose, so the final version depends on timing.
    let mut converged = false;
    for _ in 0..100 {
        if !alice.has_pending().await
            && !bob.has_pending().await
            && alice.version().await == bob.version().await
            && alice.text().await == bob.text().await
        {
            converged = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(converged, "clients diverged");
    let text = alice.text().await.unwrap();
    assert_eq!(text, "zzzzz|abcde");
}

#[tokio::test]
async fn test_cursor_broadcast_between_clients() {
    let (url, _server) = start_test_server("Hello").await;
    let (alice, _alice_events) = joined_client(&url, "Alice").await;
    let (_bob, mut bob_events) = joined_client(&url, "Bob").await;

    alice.send_cursor(CursorPosition::selection(1, 4)).await.unwrap();
    match wait_for(&mut bob_events, |e| matches!(e, SyncEvent::CursorMoved { .. })).await {
        SyncEvent::CursorMoved {
            display_name,
            color,
            position,
            ..
        } => {
            assert_eq!(display_name, "Alice");
            assert_eq!(color, UserColor::for_name("Alice"));
            assert_eq!(position, CursorPosition::selection(1, 4));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_cursor_sent_while_edit_in_flight() {
    let (url, _server) = start_test_server("Hello").await;
    let (_alice, mut alice_events) = joined_client(&url, "Alice").await;
    let (bob, _bob_events) = joined_client(&url, "Bob").await;

    // Caret right after the freshly typed "ZZ", before 'H'.
    bob.insert(0, "ZZ").await.unwrap();
    bob.send_cursor(CursorPosition::caret(2)).await.unwrap();

    match wait_for(&mut alice_events, |e| matches!(e, SyncEvent::CursorMoved { .. })).await {
        SyncEvent::CursorMoved {
            display_name, position, ..
        } => {
            assert_eq!(display_name, "Bob");
            assert_eq!(position, CursorPosition::caret(2));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_refused_edit_resyncs_client() {
    let (url, server) = start_test_server("Hello").await;
    let (alice, mut events) = joined_client(&url, "Alice").await;

    // Authored under another id: applies locally, refused by the room.
    let foreign = Operation::insert_at("doc", Uuid::nil(), 0, 5, 0, "?").unwrap();
    alice.submit(foreign).await.unwrap();
    assert_eq!(alice.text().await.as_deref(), Some("?Hello"));

    match wait_for(&mut events, |e| matches!(e, SyncEvent::Rejected { .. })).await {
        SyncEvent::Rejected { reason, .. } => {
            assert_eq!(reason, RejectReason::Malformed);
            assert!(!reason.requires_resync());
        }
        other => panic!("unexpected {other:?}"),
    }
    wait_for(&mut events, |e| matches!(e, SyncEvent::Joined { .. })).await;
    assert_eq!(alice.text().await.as_deref(), Some("Hello"));
    assert!(!alice.has_pending().await);

    // Editing works again afterwards.
    alice.insert(5, "!").await.unwrap();
    wait_for(&mut events, |e| *e == SyncEvent::Acknowledged { version: 1 }).await;
    let room = server.registry().room("doc").await.unwrap();
    assert_eq!(room.inspect(|s| s.document().content().text()).await, "Hello!");
}

#[tokio::test]
async fn test_leave_updates_users() {
    let (url, server) = start_test_server("").await;
    let (_alice, mut alice_events) = joined_client(&url, "Alice").await;
    let (bob, _bob_events) = joined_client(&url, "Bob").await;

    let both = SyncEvent::UsersUpdated(vec!["Alice".into(), "Bob".into()]);
    wait_for(&mut alice_events, |e| *e == both).await;

    bob.leave().await.unwrap();
    wait_for(&mut alice_events, |e| *e == SyncEvent::UsersUpdated(vec!["Alice".into()])).await;
    let room = server.registry().room("doc").await.unwrap();
    assert_eq!(room.client_count().await, 1);
}

#[tokio::test]
async fn test_json_client_converges() {
    let (url, _server) = start_test_server("Hello").await;
    let mut alice = SyncClient::new("Alice", "doc", &url).with_codec(Codec::Json);
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Joined { .. })).await;

    alice.insert(5, "!").await.unwrap();
    wait_for(&mut events, |e| *e == SyncEvent::Acknowledged { version: 1 }).await;
    assert_eq!(alice.text().await.as_deref(), Some("Hello!"));
}

#[tokio::test]
async fn test_reply_uses_frame_encoding() {
    let (url, _server) = start_test_server("Hi").await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let join = ClientMessage::Join {
        room_id: "doc".into(),
        display_name: "Raw".into(),
    };
    ws.send(Message::Text(join.to_json().unwrap().into())).await.unwrap();
    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    match reply {
        Message::Text(text) => match ServerMessage::from_json(text.as_str()).unwrap() {
            ServerMessage::Joined { content, version, .. } => {
                assert_eq!(content.text(), "Hi");
                assert_eq!(version, 0);
            }
            other => panic!("unexpected {other:?}"),
        },
        other => panic!("expected a text frame, got {other:?}"),
    }

    // UsersUpdated follows the join, still as JSON.
    let next = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(next, Message::Text(_)));

    ws.send(Message::Binary(ClientMessage::Ping.encode().unwrap().into())).await.unwrap();
    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    match reply {
        Message::Binary(data) => assert_eq!(ServerMessage::decode(&data).unwrap(), ServerMessage::Pong),
        other => panic!("expected a binary frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_garbage_frame_gets_error() {
    let (url, _server) = start_test_server("").await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(Message::Text("{\"not\":\"a message\"}".to_string().into())).await.unwrap();
    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    match reply {
        Message::Text(text) => assert!(matches!(
            ServerMessage::from_json(text.as_str()).unwrap(),
            ServerMessage::Error { .. }
        )),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let (url, _server) = start_test_server("").await;
    let (client, mut events) = joined_client(&url, "PingUser").await;
    client.send_ping().await.unwrap();
    wait_for(&mut events, |e| *e == SyncEvent::Pong).await;
}

#[tokio::test]
async fn test_disconnect_reclaims_room() {
    let (url, server) = start_test_server("").await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join = ClientMessage::Join {
        room_id: "doc".into(),
        display_name: "Raw".into(),
    };
    ws.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();
    timeout(Duration::from_secs(2), ws.next()).await.unwrap();
    assert_eq!(server.registry().room_count().await, 1);

    ws.close(None).await.unwrap();
    for _ in 0..100 {
        if server.registry().room_count().await == 0 {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("room not reclaimed after disconnect");
}
