//! End-to-end tests: sessions through the manager, and real WebSocket
//! servers with real clients.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tandem_collab::client::{ConnectionState, SyncClient, SyncEvent};
use tandem_collab::config::{ClientConfig, ServerConfig};
use tandem_collab::manager::{ClientLink, JoinRequest, SessionManager};
use tandem_collab::protocol::{ClientMessage, Envelope, ServerMessage};
use tandem_collab::reliability::RetryPolicy;
use tandem_collab::server::SyncServer;
use tandem_core::{ChunkConfig, OpKind};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn next_message(link: &mut ClientLink, wait: Duration) -> ServerMessage {
    timeout(wait, link.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("link closed")
        .message
}

async fn until(
    link: &mut ClientLink,
    wait: Duration,
    pred: impl Fn(&ServerMessage) -> bool,
) -> ServerMessage {
    loop {
        let message = next_message(link, wait).await;
        if pred(&message) {
            return message;
        }
    }
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_client_is_disconnected_others_continue() {
    init_logging();
    let config = ServerConfig {
        retry: RetryPolicy {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(400),
            multiplier: 2.0,
            max_attempts: 2,
        },
        ..ServerConfig::default()
    };
    let manager = SessionManager::new(config);
    manager.start().await;
    let session_id = manager.create_session("retry").await;

    // `silent` never reads nor acknowledges anything.
    let mut silent = manager
        .join(JoinRequest::new("Silent").session(session_id))
        .await
        .unwrap();
    silent.set_auto_ack(false);
    let mut bob = manager
        .join(JoinRequest::new("Bob").session(session_id))
        .await
        .unwrap();
    bob.open("f", "hello").await.unwrap();
    until(&mut bob, WAIT, |m| matches!(m, ServerMessage::FileOpened { .. })).await;

    let silent_id = silent.client_id.clone();
    let inactive = until(&mut bob, Duration::from_secs(30), |m| {
        matches!(m, ServerMessage::UserInactive { client_id, .. } if *client_id == silent_id)
    })
    .await;
    assert!(matches!(inactive, ServerMessage::UserInactive { .. }));

    let info = manager.session(session_id).await.unwrap().info().await.unwrap();
    assert_eq!(info.users, 2);
    assert_eq!(info.connected_users, 1);
    assert!(manager.stats().await.connections_lost >= 1);

    // The document keeps accepting edits from the remaining user.
    bob.edit("f", OpKind::insert(5, "!"), 0).await.unwrap();
    let ack = until(&mut bob, WAIT, |m| matches!(m, ServerMessage::Ack { .. })).await;
    assert!(matches!(ack, ServerMessage::Ack { server_version: 1, .. }));

    // The silent link was dropped by the server.
    loop {
        match timeout(WAIT, silent.recv_raw()).await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => panic!("silent link still open"),
        }
    }
    manager.stop().await;
}

async fn edit_and_wait(link: &mut ClientLink, kind: OpKind, version: u64) -> u64 {
    link.edit("f", kind, version).await.unwrap();
    match until(link, WAIT, |m| matches!(m, ServerMessage::Ack { .. })).await {
        ServerMessage::Ack { server_version, .. } => server_version,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_reconnect_replays_missed_edits_then_goes_live() {
    init_logging();
    let manager = SessionManager::new(ServerConfig::default());
    let session_id = manager.create_session("replay").await;

    let mut alice = manager
        .join(JoinRequest::new("Alice").session(session_id))
        .await
        .unwrap();
    alice.open("f", "hello").await.unwrap();
    until(&mut alice, WAIT, |m| matches!(m, ServerMessage::FileOpened { .. })).await;

    let mut bob = manager
        .join(JoinRequest::new("Bob").session(session_id))
        .await
        .unwrap();
    until(&mut bob, WAIT, |m| matches!(m, ServerMessage::SessionState { .. })).await;
    let bob_id = bob.client_id.clone();
    drop(bob);

    let mut version = 0;
    for i in 0..3 {
        version = edit_and_wait(&mut alice, OpKind::insert(i, "x"), version).await;
    }
    assert_eq!(version, 3);

    let mut bob = manager
        .join(
            JoinRequest::new("Bob")
                .session(session_id)
                .resume(bob_id, HashMap::from([("f".to_string(), 0)])),
        )
        .await
        .unwrap();
    assert!(bob.reconnected);

    let mut seen = Vec::new();
    loop {
        match next_message(&mut bob, WAIT).await {
            ServerMessage::SessionState { files, .. } => assert!(files.is_empty()),
            ServerMessage::Edit { server_version, .. } => {
                seen.push(server_version);
                if seen.len() == 3 {
                    break;
                }
            }
            _ => {}
        }
    }
    assert_eq!(seen, vec![1, 2, 3]);

    edit_and_wait(&mut alice, OpKind::insert(0, "y"), version).await;
    let live = until(&mut bob, WAIT, |m| matches!(m, ServerMessage::Edit { .. })).await;
    assert!(matches!(live, ServerMessage::Edit { server_version: 4, .. }));
}

#[tokio::test]
async fn test_duplicate_ack_is_harmless() {
    init_logging();
    let manager = SessionManager::new(ServerConfig::default());
    let mut link = manager.join(JoinRequest::new("Ada")).await.unwrap();
    link.set_auto_ack(false);

    let Envelope { message_id, message } = timeout(WAIT, link.recv()).await.unwrap().unwrap();
    assert!(matches!(message, ServerMessage::Welcome { .. }));
    let pending = manager.pool().pending(link.connection_id).await;
    assert!(pending >= 1);

    link.ack(message_id).await.unwrap();
    link.ack(message_id).await.unwrap();
    // Acks are processed in order; a heartbeat round trip flushes them.
    link.heartbeat().await.unwrap();
    let mut remaining = pending;
    for _ in 0..50 {
        remaining = manager.pool().pending(link.connection_id).await;
        if remaining == pending - 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(remaining, pending - 1);
    assert_eq!(manager.stats().await.acknowledged, 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_session_expires() {
    init_logging();
    let config = ServerConfig {
        session_grace: Duration::from_secs(2),
        cleanup_interval: Duration::from_millis(500),
        ..ServerConfig::default()
    };
    let manager = SessionManager::new(config);
    manager.start().await;
    let session_id = manager.create_session("short-lived").await;
    assert_eq!(manager.sessions().await.len(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(manager.session(session_id).await.is_none());

    let err = manager
        .join(JoinRequest::new("Late").session(session_id))
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), "session_not_found");
    manager.stop().await;
}

#[tokio::test]
async fn test_stats_track_edits() {
    init_logging();
    let manager = SessionManager::new(ServerConfig::default());
    let mut link = manager.join(JoinRequest::new("Ada")).await.unwrap();
    link.open("f", "").await.unwrap();
    until(&mut link, WAIT, |m| matches!(m, ServerMessage::FileOpened { .. })).await;
    edit_and_wait(&mut link, OpKind::insert(0, "a"), 0).await;
    edit_and_wait(&mut link, OpKind::insert(1, "b"), 1).await;

    link.edit("f", OpKind::delete(5, 1), 2).await.unwrap();
    let error = until(&mut link, WAIT, |m| matches!(m, ServerMessage::Error { .. })).await;
    assert!(matches!(error, ServerMessage::Error { code, .. } if code == "range_error"));

    let stats = manager.stats().await;
    assert_eq!(stats.edits_applied, 2);
    assert_eq!(stats.edit_errors, 1);
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.active_connections, 1);
    assert!(stats.messages_in >= 4);
    assert!(stats.messages_out >= 5);
}

async fn start_server(config: ServerConfig) -> (String, SessionManager) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = SessionManager::new(config);
    let server = SyncServer::new(manager.clone());
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (format!("ws://{addr}"), manager)
}

async fn wait_event(
    events: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

async fn wait_content(client: &SyncClient, path: &str, expected: &str) {
    for _ in 0..200 {
        if client.content(path).await.as_deref() == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "{path} is {:?}, expected {expected:?}",
        client.content(path).await
    );
}

async fn wait_synced(client: &SyncClient, path: &str) {
    for _ in 0..200 {
        if client.pending_edits(path).await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{path} still has {} pending edits", client.pending_edits(path).await);
}

#[tokio::test]
async fn test_first_frame_must_be_join() {
    init_logging();
    let (url, _manager) = start_server(ServerConfig::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    ws.send(Message::text(ClientMessage::Heartbeat.encode().unwrap()))
        .await
        .unwrap();
    let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let envelope = Envelope::decode(frame.to_text().unwrap()).unwrap();
    match envelope.message {
        ServerMessage::Error { code, .. } => assert_eq!(code, "protocol_error"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_join_over_websocket() {
    init_logging();
    let (url, manager) = start_server(ServerConfig::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let join = ClientMessage::Join {
        session_id: None,
        name: "Raw".into(),
        client_id: Some("raw-1".into()),
        last_versions: HashMap::new(),
    };
    ws.send(Message::text(join.encode().unwrap())).await.unwrap();
    let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let envelope = Envelope::decode(frame.to_text().unwrap()).unwrap();
    match envelope.message {
        ServerMessage::Welcome { client_id, reconnected, .. } => {
            assert_eq!(client_id, "raw-1");
            assert!(!reconnected);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(manager.sessions().await.len(), 1);
}

#[tokio::test]
async fn test_two_clients_converge() {
    init_logging();
    let (url, _manager) = start_server(ServerConfig::default()).await;

    let mut alice = SyncClient::new(url.as_str(), "Alice", ClientConfig::default());
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect(None).await.unwrap();
    wait_event(&mut alice_events, |e| matches!(e, SyncEvent::Connected { .. })).await;
    assert_eq!(alice.connection_state().await, ConnectionState::Connected);
    alice.open("notes.md", "hello").await.unwrap();
    wait_event(&mut alice_events, |e| matches!(e, SyncEvent::DocumentLoaded { .. })).await;

    let session_id = alice.session_id().await.unwrap();
    let mut bob = SyncClient::new(url.as_str(), "Bob", ClientConfig::default());
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect(Some(session_id)).await.unwrap();
    wait_event(&mut bob_events, |e| matches!(e, SyncEvent::DocumentLoaded { .. })).await;
    assert_eq!(bob.content("notes.md").await.as_deref(), Some("hello"));

    alice.insert("notes.md", 0, "X").await.unwrap();
    bob.delete("notes.md", 4, 1).await.unwrap();

    wait_content(&alice, "notes.md", "Xhell").await;
    wait_content(&bob, "notes.md", "Xhell").await;
    assert_eq!(alice.server_version("notes.md").await, Some(2));
    assert_eq!(bob.server_version("notes.md").await, Some(2));

    bob.chat("done").await.unwrap();
    let chat = wait_event(&mut alice_events, |e| matches!(e, SyncEvent::Chat(_))).await;
    match chat {
        SyncEvent::Chat(entry) => assert_eq!(entry.message, "done"),
        _ => unreachable!(),
    }

    bob.disconnect().await;
    let left = wait_event(&mut alice_events, |e| matches!(e, SyncEvent::UserLeft { .. })).await;
    assert!(matches!(left, SyncEvent::UserLeft { name, .. } if name == "Bob"));
}

#[tokio::test]
async fn test_chunked_document_over_websocket() {
    init_logging();
    let mut config = ServerConfig::default();
    config.session.chunk = ChunkConfig {
        threshold: 64,
        target_size: 16,
    };
    let (url, manager) = start_server(config).await;

    let content: String = (0..200).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    let mut alice = SyncClient::new(url.as_str(), "Alice", ClientConfig::default());
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect(None).await.unwrap();
    wait_event(&mut alice_events, |e| matches!(e, SyncEvent::Connected { .. })).await;
    alice.open("big.txt", &content).await.unwrap();
    wait_event(&mut alice_events, |e| matches!(e, SyncEvent::DocumentLoaded { .. })).await;
    assert_eq!(alice.content("big.txt").await.as_deref(), Some(content.as_str()));
    assert_eq!(manager.stats().await.chunked_documents, 1);

    let session_id = alice.session_id().await.unwrap();
    let mut bob = SyncClient::new(url.as_str(), "Bob", ClientConfig::default());
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect(Some(session_id)).await.unwrap();
    wait_event(&mut bob_events, |e| matches!(e, SyncEvent::DocumentLoaded { .. })).await;

    alice.insert("big.txt", 100, "MIDDLE").await.unwrap();
    bob.delete("big.txt", 0, 10).await.unwrap();

    let mut expected = content.clone();
    expected.insert_str(100, "MIDDLE");
    expected.replace_range(0..10, "");
    wait_content(&alice, "big.txt", &expected).await;
    wait_content(&bob, "big.txt", &expected).await;
}

#[tokio::test]
async fn test_bad_frame_after_join_gets_error_and_connection_stays() {
    init_logging();
    let (url, _manager) = start_server(ServerConfig::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let join = ClientMessage::Join {
        session_id: None,
        name: "Raw".into(),
        client_id: None,
        last_versions: HashMap::new(),
    };
    ws.send(Message::text(join.encode().unwrap())).await.unwrap();
    ws.send(Message::text("{not json".to_string())).await.unwrap();
    ws.send(Message::text(ClientMessage::Chat { message: "still here".into() }.encode().unwrap()))
        .await
        .unwrap();

    let mut got_error = false;
    loop {
        let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        let Ok(text) = frame.to_text() else { continue };
        match Envelope::decode(text).unwrap().message {
            ServerMessage::Error { code, .. } => {
                assert_eq!(code, "protocol_error");
                got_error = true;
            }
            ServerMessage::Chat { entry } => {
                assert_eq!(entry.message, "still here");
                break;
            }
            _ => {}
        }
    }
    assert!(got_error);
}

/// TCP relay between clients and the server whose live connections can
/// be cut while it keeps accepting new ones.
struct Relay {
    url: String,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Relay {
    async fn start(server_url: &str) -> Self {
        let target = server_url.trim_start_matches("ws://").to_string();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let links = Arc::new(Mutex::new(Vec::new()));
        let tracked = links.clone();
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let target = target.clone();
                let link = tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(target.as_str()).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
                tracked.lock().unwrap().push(link);
            }
        });
        Self {
            url: format!("ws://{addr}"),
            links,
        }
    }

    fn cut(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }
}

#[tokio::test]
async fn test_reconnected_client_matches_client_that_stayed_online() {
    init_logging();
    let (url, _manager) = start_server(ServerConfig::default()).await;
    let relay = Relay::start(&url).await;

    let mut alice = SyncClient::new(url.as_str(), "Alice", ClientConfig::default());
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect(None).await.unwrap();
    wait_event(&mut alice_events, |e| matches!(e, SyncEvent::Connected { .. })).await;
    alice.open("notes.md", "hello").await.unwrap();
    wait_event(&mut alice_events, |e| matches!(e, SyncEvent::DocumentLoaded { .. })).await;
    let session_id = alice.session_id().await.unwrap();

    let config = ClientConfig {
        reconnect: RetryPolicy {
            initial_interval: Duration::from_millis(300),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_attempts: 10,
        },
        ..ClientConfig::default()
    };
    let mut bob = SyncClient::new(relay.url.as_str(), "Bob", config);
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect(Some(session_id)).await.unwrap();
    wait_event(&mut bob_events, |e| matches!(e, SyncEvent::DocumentLoaded { .. })).await;

    // Bob's edit may or may not reach the server before the cut.
    bob.insert("notes.md", 5, "!").await.unwrap();
    relay.cut();
    wait_event(&mut bob_events, |e| matches!(e, SyncEvent::Disconnected)).await;

    for digit in ["1", "2", "3"] {
        alice.insert("notes.md", 0, digit).await.unwrap();
    }
    wait_event(&mut alice_events, |e| {
        matches!(e, SyncEvent::EditAcknowledged { server_version, .. } if *server_version >= 3)
    })
    .await;

    let reconnected =
        wait_event(&mut bob_events, |e| matches!(e, SyncEvent::Connected { .. })).await;
    assert!(matches!(reconnected, SyncEvent::Connected { reconnected: true, .. }));

    wait_content(&bob, "notes.md", "321hello!").await;
    wait_content(&alice, "notes.md", "321hello!").await;
    wait_synced(&bob, "notes.md").await;
    wait_synced(&alice, "notes.md").await;
    assert_eq!(
        bob.server_version("notes.md").await,
        alice.server_version("notes.md").await
    );
}

#[tokio::test]
async fn test_zero_heartbeat_interval_keeps_client_running() {
    init_logging();
    let (url, _manager) = start_server(ServerConfig::default()).await;
    let config = ClientConfig {
        heartbeat_interval: Duration::ZERO,
        ..ClientConfig::default()
    };
    let mut client = SyncClient::new(url.as_str(), "Ada", config);
    let mut events = client.take_event_rx().unwrap();
    client.connect(None).await.unwrap();
    wait_event(&mut events, |e| matches!(e, SyncEvent::Connected { .. })).await;

    client.open("f", "abc").await.unwrap();
    wait_event(&mut events, |e| matches!(e, SyncEvent::DocumentLoaded { .. })).await;
    client.insert("f", 3, "d").await.unwrap();
    wait_event(&mut events, |e| matches!(e, SyncEvent::EditAcknowledged { .. })).await;
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(client.content("f").await.as_deref(), Some("abcd"));
}
