//! End-to-end tests: a real server on a free port and real clients.

use std::sync::Arc;

use telemetry_collab::client::{ClientError, ConnectionState, SyncClient, SyncEvent};
use telemetry_collab::protocol::PeerInfo;
use telemetry_collab::room::{DocumentId, RoomConfig};
use telemetry_collab::server::{ServerConfig, SyncServer};
use telemetry_collab::storage::{MemoryStoryStore, StoryRecord};
use telemetry_core::{BlockKind, BlockSpec, Format, RunSpec};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};

/// Start a server on a free port; returns its base URL.
async fn start_test_server(store: Arc<MemoryStoryStore>, room: RoomConfig) -> (String, SyncServer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        bind_addr: addr.to_string(),
        room,
        ..ServerConfig::default()
    };
    let server = SyncServer::new(config, store);
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (format!("ws://{addr}"), server)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn paragraph_text(client: &SyncClient) -> String {
    let snapshot = client.snapshot();
    snapshot.block_text(snapshot.blocks()[1])
}

#[tokio::test]
async fn test_empty_story_starts_with_placeholders() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("42", StoryRecord::default());
    let (url, _server) = start_test_server(store, RoomConfig::default()).await;

    let client = SyncClient::connect(&url, 42u64, PeerInfo::new("Alice")).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(
        client.snapshot().to_specs(),
        vec![
            BlockSpec::plain(BlockKind::Title, "Untitled."),
            BlockSpec::plain(BlockKind::Paragraph, "Start typing here..."),
        ]
    );
}

#[tokio::test]
async fn test_stored_title_fills_missing_heading() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("3", StoryRecord::new("<p>Body</p>").with_title("Stored"));
    let (url, _server) = start_test_server(store, RoomConfig::default()).await;

    let client = SyncClient::connect(&url, "3", PeerInfo::new("Alice")).await.unwrap();
    let story = client.story();
    assert_eq!(story.title.as_deref(), Some("Stored"));
    assert_eq!(story.content, "<h1>Stored</h1><p>Body</p>");
}

#[tokio::test]
async fn test_missing_story_is_rejected() {
    let store = Arc::new(MemoryStoryStore::new());
    let (url, server) = start_test_server(store, RoomConfig::default()).await;

    let result = SyncClient::connect(&url, "404", PeerInfo::new("Alice")).await;
    assert!(matches!(result, Err(ClientError::Rejected(_))));
    assert!(server.registry().active_rooms().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_inserts_converge() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("42", StoryRecord::new("<h1>T</h1><p>!</p>"));
    let (url, _server) = start_test_server(store, RoomConfig::default()).await;

    let alice = SyncClient::connect(&url, 42u64, PeerInfo::new("Alice")).await.unwrap();
    let bob = SyncClient::connect(&url, 42u64, PeerInfo::new("Bob")).await.unwrap();

    let a_key = alice.snapshot().blocks()[1];
    let b_key = bob.snapshot().blocks()[1];
    assert!(alice.edit(|edit| edit.insert_text(a_key, 0, "foo")).unwrap());
    assert!(bob.edit(|edit| edit.insert_text(b_key, 0, "bar")).unwrap());

    wait_until(|| paragraph_text(&alice).len() == 7 && paragraph_text(&bob).len() == 7).await;
    let text = paragraph_text(&alice);
    assert_eq!(text, paragraph_text(&bob));
    assert!(text == "foobar!" || text == "barfoo!", "unexpected merge {text}");
    assert_eq!(alice.snapshot().to_specs(), bob.snapshot().to_specs());
}

#[tokio::test]
async fn test_late_joiner_sees_earlier_edits() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("21", StoryRecord::new("<h1>Draft</h1><p>body</p>"));
    let (url, _server) = start_test_server(store, RoomConfig::default()).await;

    let alice = SyncClient::connect(&url, "21", PeerInfo::new("Alice")).await.unwrap();
    let carol = SyncClient::connect(&url, "21", PeerInfo::new("Carol")).await.unwrap();

    let blocks = alice.snapshot().blocks().to_vec();
    alice
        .edit(|edit| {
            edit.insert_text(blocks[0], 5, " two")?;
            edit.insert_text(blocks[1], 4, " text")?;
            Ok(())
        })
        .unwrap();
    // once a peer has the edits, the room has them too
    wait_until(|| carol.snapshot().to_specs() == alice.snapshot().to_specs()).await;

    let bob = SyncClient::connect(&url, "21", PeerInfo::new("Bob")).await.unwrap();
    assert_eq!(
        bob.snapshot().to_specs(),
        vec![
            BlockSpec::plain(BlockKind::Title, "Draft two"),
            BlockSpec::plain(BlockKind::Paragraph, "body text"),
        ]
    );
    assert_eq!(bob.story().title.as_deref(), Some("Draft two"));
}

#[tokio::test]
async fn test_formatting_and_structure_propagate() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("8", StoryRecord::new("<h1>T</h1><p>hello world</p>"));
    let (url, _server) = start_test_server(store, RoomConfig::default()).await;

    let alice = SyncClient::connect(&url, "8", PeerInfo::new("Alice")).await.unwrap();
    let bob = SyncClient::connect(&url, "8", PeerInfo::new("Bob")).await.unwrap();

    let key = alice.snapshot().blocks()[1];
    alice
        .edit(|edit| {
            edit.format_text(key, 0, 5, Format::BOLD, true)?;
            edit.split_block(key, 5)?;
            Ok(())
        })
        .unwrap();

    let expected = vec![
        BlockSpec::plain(BlockKind::Title, "T"),
        BlockSpec::new(BlockKind::Paragraph, vec![RunSpec::new("hello", Format::BOLD)]),
        BlockSpec::plain(BlockKind::Paragraph, " world"),
    ];
    assert_eq!(alice.snapshot().to_specs(), expected);
    wait_until(|| bob.snapshot().to_specs() == expected).await;
}

#[tokio::test]
async fn test_remote_change_events() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("5", StoryRecord::new("<p>x</p>"));
    let (url, _server) = start_test_server(store, RoomConfig::default()).await;

    let alice = SyncClient::connect(&url, "5", PeerInfo::new("Alice")).await.unwrap();
    let mut bob = SyncClient::connect(&url, "5", PeerInfo::new("Bob")).await.unwrap();
    let mut events = bob.take_events().unwrap();

    let key = alice.snapshot().blocks()[1];
    alice.edit(|edit| edit.insert_text(key, 1, "y")).unwrap();

    let change = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(SyncEvent::RemoteChange(update)) = events.recv().await {
                return update;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(change.next.block_text(change.next.blocks()[1]), "xy");
}

#[tokio::test]
async fn test_peer_join_and_leave() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("6", StoryRecord::default());
    let (url, server) = start_test_server(store, RoomConfig::default()).await;

    let mut alice = SyncClient::connect(&url, "6", PeerInfo::new("Alice")).await.unwrap();
    let mut events = alice.take_events().unwrap();
    let mut bob = SyncClient::connect(&url, "6", PeerInfo::new("Bob")).await.unwrap();

    let joined = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
    match joined {
        Some(SyncEvent::PeerJoined(info)) => assert_eq!(info.peer_id, bob.peer_id()),
        other => panic!("expected PeerJoined, got {other:?}"),
    }
    wait_until(|| bob.peers().iter().any(|p| p.peer_id == alice.peer_id())).await;
    assert_eq!(
        server
            .registry()
            .connection_counts()
            .await
            .get(&DocumentId::from("6")),
        Some(&2)
    );

    bob.disconnect().await;
    let left = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(SyncEvent::PeerLeft(id)) = events.recv().await {
                return id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(left, bob.peer_id());
    assert!(alice.peers().is_empty());

    alice.disconnect().await;
    for _ in 0..200 {
        if server.registry().active_rooms().await.is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(server.registry().active_rooms().await.is_empty());
}

#[tokio::test]
async fn test_disconnected_client_rejects_edits() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("9", StoryRecord::default());
    let (url, _server) = start_test_server(store, RoomConfig::default()).await;

    let mut alice = SyncClient::connect(&url, "9", PeerInfo::new("Alice")).await.unwrap();
    let key = alice.snapshot().blocks()[1];
    alice.disconnect().await;

    assert_eq!(alice.state(), ConnectionState::Disconnected);
    assert!(matches!(
        alice.edit(|edit| edit.insert_text(key, 0, "lost")),
        Err(ClientError::Disconnected)
    ));
}

#[tokio::test]
async fn test_server_stats_count_connections() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("1", StoryRecord::default());
    let (url, server) = start_test_server(store, RoomConfig::default()).await;

    let _alice = SyncClient::connect(&url, "1", PeerInfo::new("Alice")).await.unwrap();
    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.active_rooms, 1);
    assert!(stats.total_messages >= 1);
}

#[tokio::test]
async fn test_frames_before_handshake_are_ignored() {
    use futures_util::{SinkExt, StreamExt};
    use telemetry_collab::protocol::{MessageType, SyncMessage};
    use tokio_tungstenite::tungstenite::Message;

    let store = Arc::new(MemoryStoryStore::new());
    store.insert("2", StoryRecord::default());
    let (url, _server) = start_test_server(store, RoomConfig::default()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/2")).await.unwrap();
    let info = PeerInfo::new("Raw");
    let early = SyncMessage::update(info.peer_id, 0, vec![1, 2, 3]).encode().unwrap();
    ws.send(Message::Binary(early.into())).await.unwrap();
    let hello = SyncMessage::peer_joined(&info).unwrap().encode().unwrap();
    ws.send(Message::Binary(hello.into())).await.unwrap();

    let mut frames = Vec::new();
    while frames.len() < 2 {
        if let Message::Binary(data) = ws.next().await.unwrap().unwrap() {
            frames.push(SyncMessage::decode(&data).unwrap());
        }
    }
    assert_eq!(frames[0].msg_type, MessageType::SyncStep2);
    assert_eq!(frames[1].msg_type, MessageType::PeerJoined);
    let own = frames[1].peer_info().unwrap();
    assert_eq!(own.peer_id, info.peer_id);
    assert!(own.color.starts_with('#'));
}
