//! Process-wide map from story id to its room.
//!
//! The table lock is held only to look a room up, create one, or queue a
//! join on it. Rooms remove themselves (under the same lock) when they
//! close, so a join either lands in a live room's queue or finds the
//! entry gone and starts a fresh room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::protocol::PeerInfo;
use crate::room::{self, DocumentId, JoinAccepted, RoomCommand, RoomConfig, RoomError, RoomHandle, RoomInfo, RoomTable};
use crate::storage::StoryStore;

pub struct RoomRegistry {
    rooms: RoomTable,
    store: Arc<dyn StoryStore>,
    config: RoomConfig,
    next_generation: AtomicU64,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn StoryStore>, config: RoomConfig) -> Self {
        Self {
            rooms: RoomTable::default(),
            store,
            config,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StoryStore> {
        &self.store
    }

    /// Join the room for `id`, starting (and loading) it if needed.
    pub async fn join(&self, id: &DocumentId, info: PeerInfo) -> Result<(RoomHandle, JoinAccepted), RoomError> {
        let (reply, accepted) = oneshot::channel();
        let mut cmd = RoomCommand::Join { info, reply };

        let handle = {
            let mut rooms = self.rooms.lock().await;
            loop {
                let handle = match rooms.get(id) {
                    Some(handle) => handle.clone(),
                    None => {
                        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                        log::debug!("starting room {id} (generation {generation})");
                        let handle = room::spawn(
                            id.clone(),
                            generation,
                            self.config.clone(),
                            self.store.clone(),
                            self.rooms.clone(),
                        );
                        rooms.insert(id.clone(), handle.clone());
                        handle
                    }
                };
                match handle.send(cmd) {
                    Ok(()) => break handle,
                    Err(returned) => {
                        // closed without unregistering; replace it
                        rooms.remove(id);
                        cmd = returned;
                    }
                }
            }
        };

        let accepted = accepted
            .await
            .map_err(|_| RoomError::Closed(id.clone()))??;
        Ok((handle, accepted))
    }

    pub async fn get(&self, id: &DocumentId) -> Option<RoomHandle> {
        self.rooms.lock().await.get(id).cloned()
    }

    pub async fn inspect(&self, id: &DocumentId) -> Option<RoomInfo> {
        let handle = self.get(id).await?;
        handle.inspect().await.ok()
    }

    pub async fn active_rooms(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.rooms.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Live connection count of every registered room.
    pub async fn connection_counts(&self) -> HashMap<DocumentId, usize> {
        let handles: Vec<RoomHandle> = self.rooms.lock().await.values().cloned().collect();
        let mut counts = HashMap::new();
        for handle in handles {
            if let Ok(info) = handle.inspect().await {
                counts.insert(info.id, info.connections);
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::RoomState;
    use crate::storage::{MemoryStoryStore, StoryRecord};
    use std::time::Duration;

    fn registry(store: Arc<MemoryStoryStore>) -> RoomRegistry {
        RoomRegistry::new(store, RoomConfig::default())
    }

    #[tokio::test]
    async fn test_joins_share_one_room() {
        let store = Arc::new(MemoryStoryStore::new());
        store.insert("42", StoryRecord::default());
        let registry = registry(store.clone());
        let id = DocumentId::from(42u64);

        let (first, _a) = registry.join(&id, PeerInfo::new("a")).await.unwrap();
        let (second, _b) = registry.join(&id, PeerInfo::new("b")).await.unwrap();
        assert_eq!(first.generation(), second.generation());
        assert_eq!(store.fetch_count(), 1);
        assert_eq!(registry.active_rooms().await, vec![id.clone()]);
        assert_eq!(registry.connection_counts().await.get(&id), Some(&2));
    }

    #[tokio::test]
    async fn test_concurrent_joins_load_once() {
        let store = Arc::new(MemoryStoryStore::new());
        store.insert("7", StoryRecord::default());
        store.set_fetch_delay(Some(Duration::from_millis(50)));
        let registry = Arc::new(registry(store.clone()));
        let id = DocumentId::from("7");

        let joins: Vec<_> = (0..5)
            .map(|i| {
                let registry = registry.clone();
                let id = id.clone();
                tokio::spawn(async move { registry.join(&id, PeerInfo::new(format!("p{i}"))).await.map(|_| ()) })
            })
            .collect();
        for join in joins {
            join.await.unwrap().unwrap();
        }
        assert_eq!(store.fetch_count(), 1);
        assert_eq!(registry.inspect(&id).await.unwrap().connections, 5);
    }

    #[tokio::test]
    async fn test_load_failure_then_retry() {
        let store = Arc::new(MemoryStoryStore::new());
        store.insert("9", StoryRecord::new("<p>hi</p>"));
        store.fail_fetches(true);
        let registry = registry(store.clone());
        let id = DocumentId::from("9");

        assert!(matches!(
            registry.join(&id, PeerInfo::new("a")).await,
            Err(RoomError::Load { .. })
        ));
        assert!(registry.get(&id).await.is_none());

        store.fail_fetches(false);
        let (handle, accepted) = registry.join(&id, PeerInfo::new("a")).await.unwrap();
        assert!(!accepted.state.is_empty());
        assert_eq!(handle.state(), RoomState::Ready);
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_room_is_replaced() {
        let store = Arc::new(MemoryStoryStore::new());
        store.insert("5", StoryRecord::default());
        let registry = registry(store.clone());
        let id = DocumentId::from("5");

        let (first, accepted) = registry.join(&id, PeerInfo::new("a")).await.unwrap();
        first.leave(accepted.info.peer_id);
        assert_eq!(first.wait_for_state(RoomState::Closed).await, RoomState::Closed);
        assert!(registry.active_rooms().await.is_empty());

        let (second, _) = registry.join(&id, PeerInfo::new("b")).await.unwrap();
        assert_ne!(first.generation(), second.generation());
        assert_eq!(store.fetch_count(), 2);
    }
}
