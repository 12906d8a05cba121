//! Awareness over a running server: relays, colours, cleanup.

use std::sync::Arc;

use telemetry_collab::client::{SyncClient, SyncEvent};
use telemetry_collab::presence::{AwarenessMessage, AwarenessState, CursorColor, SelectionRange};
use telemetry_collab::protocol::PeerInfo;
use telemetry_collab::room::RoomConfig;
use telemetry_collab::server::{ServerConfig, SyncServer};
use telemetry_collab::storage::{MemoryStoryStore, StoryRecord};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};

async fn start_test_server(store: Arc<MemoryStoryStore>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        bind_addr: addr.to_string(),
        room: RoomConfig::default(),
        ..ServerConfig::default()
    };
    let server = SyncServer::new(config, store);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    format!("ws://{addr}")
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

fn story_store() -> Arc<MemoryStoryStore> {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("42", StoryRecord::new("<h1>T</h1><p>hello</p>").with_author("u-1"));
    store
}

fn caret_state(name: &str, offset: usize) -> AwarenessState {
    AwarenessState {
        name: name.into(),
        color: "#ffffff".into(),
        selection: Some(SelectionRange::caret(1, offset)),
    }
}

#[tokio::test]
async fn test_awareness_is_relayed_with_assigned_color() {
    let url = start_test_server(story_store()).await;
    let alice = SyncClient::connect(&url, 42u64, PeerInfo::new("Alice")).await.unwrap();
    let mut bob = SyncClient::connect(&url, 42u64, PeerInfo::new("Bob")).await.unwrap();
    let mut events = bob.take_events().unwrap();

    alice.set_awareness(caret_state("Alice", 3)).unwrap();

    let message = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(SyncEvent::Awareness(message)) = events.recv().await {
                return message;
            }
        }
    })
    .await
    .unwrap();

    wait_until(|| alice.info().color.starts_with('#') && alice.info().color != "#ffffff").await;
    match message {
        AwarenessMessage::Update { peer_id, state, .. } => {
            assert_eq!(peer_id, alice.peer_id());
            assert_eq!(state.selection, Some(SelectionRange::caret(1, 3)));
            assert_eq!(state.color, alice.info().color);
        }
        other => panic!("expected an update, got {other:?}"),
    }
}

#[tokio::test]
async fn test_author_gets_reserved_color() {
    let url = start_test_server(story_store()).await;
    let author = SyncClient::connect(&url, 42u64, PeerInfo::new("Ann").with_user("u-1"))
        .await
        .unwrap();
    let guest = SyncClient::connect(&url, 42u64, PeerInfo::new("Gus").with_user("u-2"))
        .await
        .unwrap();

    let reserved = CursorColor::AUTHOR.to_hex();
    wait_until(|| author.info().color == reserved).await;
    wait_until(|| !guest.info().color.is_empty()).await;
    assert_ne!(guest.info().color, reserved);
    assert_eq!(guest.info().color, CursorColor::from_uuid(guest.peer_id()).to_hex());
}

#[tokio::test]
async fn test_late_joiner_receives_existing_awareness() {
    let url = start_test_server(story_store()).await;
    let alice = SyncClient::connect(&url, 42u64, PeerInfo::new("Alice")).await.unwrap();
    let bob = SyncClient::connect(&url, 42u64, PeerInfo::new("Bob")).await.unwrap();
    alice.set_awareness(caret_state("Alice", 1)).unwrap();
    wait_until(|| !bob.remote_awareness().is_empty()).await;

    let carol = SyncClient::connect(&url, 42u64, PeerInfo::new("Carol")).await.unwrap();
    wait_until(|| {
        carol
            .remote_awareness()
            .iter()
            .any(|(id, state)| *id == alice.peer_id() && state.name == "Alice")
    })
    .await;
}

#[tokio::test]
async fn test_awareness_cleared_when_peer_leaves() {
    let url = start_test_server(story_store()).await;
    let mut alice = SyncClient::connect(&url, 42u64, PeerInfo::new("Alice")).await.unwrap();
    let bob = SyncClient::connect(&url, 42u64, PeerInfo::new("Bob")).await.unwrap();

    alice.set_awareness(caret_state("Alice", 2)).unwrap();
    wait_until(|| bob.remote_awareness().len() == 1).await;

    alice.disconnect().await;
    wait_until(|| bob.remote_awareness().is_empty() && bob.peers().is_empty()).await;
}

#[tokio::test]
async fn test_selection_updates_are_throttled() {
    let url = start_test_server(story_store()).await;
    let alice = SyncClient::connect(&url, 42u64, PeerInfo::new("Alice")).await.unwrap();
    let bob = SyncClient::connect(&url, 42u64, PeerInfo::new("Bob")).await.unwrap();

    // connecting set the local state, which opens a throttle window
    sleep(Duration::from_millis(50)).await;
    assert!(alice.update_selection(Some(SelectionRange::caret(1, 1))).unwrap());
    assert!(!alice.update_selection(Some(SelectionRange::caret(1, 2))).unwrap());

    // the held-back caret still arrives without another move
    wait_until(|| {
        bob.remote_awareness()
            .iter()
            .any(|(_, state)| state.selection == Some(SelectionRange::caret(1, 2)))
    })
    .await;

    sleep(Duration::from_millis(50)).await;
    assert!(alice.update_selection(Some(SelectionRange::caret(1, 4))).unwrap());
    wait_until(|| {
        bob.remote_awareness()
            .iter()
            .any(|(_, state)| state.selection == Some(SelectionRange::caret(1, 4)))
    })
    .await;
}
