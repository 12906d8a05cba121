//! Debounced persistence through a running server.

use std::sync::Arc;

use telemetry_collab::client::SyncClient;
use telemetry_collab::protocol::PeerInfo;
use telemetry_collab::room::{DocumentId, RoomConfig};
use telemetry_collab::server::{ServerConfig, SyncServer};
use telemetry_collab::storage::{
    MemoryStoryStore, RocksStoryStore, StoreConfig, StoryRecord, StoryStore,
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};

async fn start_test_server(store: Arc<dyn StoryStore>, room: RoomConfig) -> (String, SyncServer) {
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

fn type_text(client: &SyncClient, text: &str) {
    let key = client.snapshot().blocks()[1];
    let end = client.snapshot().block_text(key).chars().count();
    client.edit(|edit| edit.insert_text(key, end, text)).unwrap();
}

#[tokio::test]
async fn test_burst_of_edits_is_pushed_once() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("42", StoryRecord::new("<h1>Title</h1><p>one</p>"));
    let room = RoomConfig {
        persist_debounce: Duration::from_millis(200),
        persist_max_wait: Duration::from_secs(5),
        ..RoomConfig::default()
    };
    let (url, _server) = start_test_server(store.clone(), room).await;

    let alice = SyncClient::connect(&url, 42u64, PeerInfo::new("Alice")).await.unwrap();
    for word in [" two", " three", " four"] {
        type_text(&alice, word);
    }

    wait_until(|| store.push_count() == 1).await;
    sleep(Duration::from_millis(400)).await;
    let pushes = store.pushes();
    assert_eq!(pushes.len(), 1);

    let (id, update) = &pushes[0];
    assert_eq!(id, "42");
    assert_eq!(update.content.as_deref(), Some("<h1>Title</h1><p>one two three four</p>"));
    assert_eq!(update.title.as_deref(), Some("Title"));
    assert_eq!(update.word_count, Some(5));
    assert_eq!(update.is_published, None);
}

#[tokio::test]
async fn test_max_wait_bounds_continuous_typing() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("7", StoryRecord::new("<p>x</p>"));
    let room = RoomConfig {
        persist_debounce: Duration::from_millis(400),
        persist_max_wait: Duration::from_millis(300),
        ..RoomConfig::default()
    };
    let (url, _server) = start_test_server(store.clone(), room).await;

    let alice = SyncClient::connect(&url, "7", PeerInfo::new("Alice")).await.unwrap();
    for _ in 0..10 {
        type_text(&alice, "a");
        sleep(Duration::from_millis(100)).await;
    }
    assert!(store.push_count() >= 1, "typing never paused, but max wait should force a push");
}

#[tokio::test]
async fn test_failed_pushes_are_retried() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("9", StoryRecord::new("<p>x</p>"));
    store.fail_next_pushes(2);
    let room = RoomConfig {
        persist_debounce: Duration::from_millis(50),
        persist_retry: Duration::from_millis(100),
        ..RoomConfig::default()
    };
    let (url, server) = start_test_server(store.clone(), room).await;

    let alice = SyncClient::connect(&url, "9", PeerInfo::new("Alice")).await.unwrap();
    type_text(&alice, "y");

    wait_until(|| store.push_count() == 1).await;
    assert_eq!(store.get("9").unwrap().content, "<h1>Untitled.</h1><p>xy</p>");

    let id = DocumentId::from("9");
    let mut info = server.registry().inspect(&id).await.unwrap();
    for _ in 0..100 {
        if info.persists == 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
        info = server.registry().inspect(&id).await.unwrap();
    }
    assert_eq!(info.persist_failures, 2);
    assert_eq!(info.persists, 1);
    assert!(!info.dirty);

    // the room keeps serving edits after the failures
    type_text(&alice, "z");
    wait_until(|| store.push_count() == 2).await;
}

#[tokio::test]
async fn test_edits_accumulate_across_failed_push() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("10", StoryRecord::new("<p>x</p>"));
    store.fail_next_pushes(1);
    let room = RoomConfig {
        persist_debounce: Duration::from_millis(50),
        persist_retry: Duration::from_millis(300),
        ..RoomConfig::default()
    };
    let (url, server) = start_test_server(store.clone(), room).await;

    let alice = SyncClient::connect(&url, "10", PeerInfo::new("Alice")).await.unwrap();
    type_text(&alice, "1");

    let id = DocumentId::from("10");
    timeout(Duration::from_secs(5), async {
        while server.registry().inspect(&id).await.map_or(0, |info| info.persist_failures) == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first push never failed");

    // typed while the retry is pending
    type_text(&alice, "2");
    wait_until(|| store.push_count() == 1).await;

    let pushes = store.pushes();
    assert_eq!(pushes[0].1.content.as_deref(), Some("<h1>Untitled.</h1><p>x12</p>"));
    assert_eq!(store.get("10").unwrap().content, "<h1>Untitled.</h1><p>x12</p>");
}

#[tokio::test]
async fn test_load_failure_then_recovery() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("11", StoryRecord::new("<p>ok</p>"));
    store.fail_fetches(true);
    let (url, server) = start_test_server(store.clone(), RoomConfig::default()).await;

    assert!(SyncClient::connect(&url, "11", PeerInfo::new("Alice")).await.is_err());
    assert!(server.registry().active_rooms().await.is_empty());

    store.fail_fetches(false);
    let alice = SyncClient::connect(&url, "11", PeerInfo::new("Alice")).await.unwrap();
    assert_eq!(alice.story().content, "<h1>Untitled.</h1><p>ok</p>");
}

#[tokio::test]
async fn test_last_leave_flushes_pending_changes() {
    let store = Arc::new(MemoryStoryStore::new());
    store.insert("12", StoryRecord::new("<p>draft</p>"));
    let room = RoomConfig {
        persist_debounce: Duration::from_secs(30),
        persist_max_wait: Duration::from_secs(60),
        idle_timeout: Duration::ZERO,
        ..RoomConfig::default()
    };
    let (url, server) = start_test_server(store.clone(), room).await;

    let mut alice = SyncClient::connect(&url, "12", PeerInfo::new("Alice")).await.unwrap();
    type_text(&alice, "!");
    // give the update time to reach the room before leaving
    sleep(Duration::from_millis(100)).await;
    alice.disconnect().await;

    wait_until(|| store.push_count() == 1).await;
    assert_eq!(store.get("12").unwrap().content, "<h1>Untitled.</h1><p>draft!</p>");
    for _ in 0..200 {
        if server.registry().active_rooms().await.is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(server.registry().active_rooms().await.is_empty());
}

#[tokio::test]
async fn test_rocks_store_behind_server() {
    let dir = TempDir::new().unwrap();
    let rocks = Arc::new(RocksStoryStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    rocks
        .put_record("21", &StoryRecord::new("<h1>Saved</h1><p>body</p>").with_author("u-1"))
        .unwrap();
    let room = RoomConfig {
        persist_debounce: Duration::from_millis(50),
        ..RoomConfig::default()
    };
    let (url, _server) = start_test_server(rocks.clone(), room).await;

    let alice = SyncClient::connect(&url, "21", PeerInfo::new("Alice")).await.unwrap();
    type_text(&alice, " text");

    let expected = "<h1>Saved</h1><p>body text</p>";
    wait_until(|| {
        rocks
            .load("21")
            .ok()
            .flatten()
            .is_some_and(|record| record.content == expected)
    })
    .await;
    let meta = rocks.load_metadata("21").unwrap().unwrap();
    assert_eq!(meta.word_count, 3);
    assert_eq!(meta.author_id.as_deref(), Some("u-1"));
}
