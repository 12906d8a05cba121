//! In-process story store with a push log and fault injection.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use super::{StoreError, StoryRecord, StoryStore, StoryUpdate};

#[derive(Default)]
struct Inner {
    records: HashMap<String, StoryRecord>,
    pushes: Vec<(String, StoryUpdate)>,
    failing_pushes: usize,
    fail_fetches: bool,
    fetch_delay: Option<Duration>,
    push_delay: Option<Duration>,
    fetch_count: usize,
}

/// Stories held in memory.
///
/// Every successful push is recorded; failures can be scheduled for the
/// next N pushes or for all fetches.
#[derive(Default)]
pub struct MemoryStoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, record: StoryRecord) {
        self.inner.lock().records.insert(id.into(), record);
    }

    pub fn get(&self, id: &str) -> Option<StoryRecord> {
        self.inner.lock().records.get(id).cloned()
    }

    /// Successful pushes, oldest first.
    pub fn pushes(&self) -> Vec<(String, StoryUpdate)> {
        self.inner.lock().pushes.clone()
    }

    pub fn push_count(&self) -> usize {
        self.inner.lock().pushes.len()
    }

    pub fn fetch_count(&self) -> usize {
        self.inner.lock().fetch_count
    }

    /// Make the next `n` pushes fail.
    pub fn fail_next_pushes(&self, n: usize) {
        self.inner.lock().failing_pushes = n;
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.inner.lock().fail_fetches = fail;
    }

    /// Slow every fetch down (to observe the loading state).
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.inner.lock().fetch_delay = delay;
    }

    /// Slow every push down (a hung blog API).
    pub fn set_push_delay(&self, delay: Option<Duration>) {
        self.inner.lock().push_delay = delay;
    }
}

#[async_trait]
impl StoryStore for MemoryStoryStore {
    async fn fetch(&self, id: &str) -> Result<Option<StoryRecord>, StoreError> {
        let delay = {
            let mut inner = self.inner.lock();
            inner.fetch_count += 1;
            inner.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let inner = self.inner.lock();
        if inner.fail_fetches {
            return Err(StoreError::Simulated(format!("fetch {id}")));
        }
        Ok(inner.records.get(id).cloned())
    }

    async fn push(&self, id: &str, update: StoryUpdate) -> Result<(), StoreError> {
        let delay = self.inner.lock().push_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        if inner.failing_pushes > 0 {
            inner.failing_pushes -= 1;
            return Err(StoreError::Simulated(format!("push {id}")));
        }
        let record = inner.records.entry(id.to_string()).or_default();
        update.apply_to(record);
        inner.pushes.push((id.to_string(), update));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_missing_story() {
        let store = MemoryStoryStore::new();
        assert_eq!(store.fetch("nope").await.unwrap(), None);
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_push_updates_record() {
        let store = MemoryStoryStore::new();
        store.insert("7", StoryRecord::new("<p>a</p>").with_title("A"));
        store
            .push(
                "7",
                StoryUpdate {
                    content: Some("<p>b</p>".into()),
                    word_count: Some(1),
                    ..StoryUpdate::default()
                },
            )
            .await
            .unwrap();
        let record = store.fetch("7").await.unwrap().unwrap();
        assert_eq!(record.content, "<p>b</p>");
        assert_eq!(record.title.as_deref(), Some("A"));
        assert_eq!(store.push_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStoryStore::new();
        store.fail_next_pushes(2);
        assert!(store.push("1", StoryUpdate::default()).await.is_err());
        assert!(store.push("1", StoryUpdate::default()).await.is_err());
        assert!(store.push("1", StoryUpdate::default()).await.is_ok());
        assert_eq!(store.push_count(), 1);

        store.fail_fetches(true);
        assert!(matches!(store.fetch("1").await, Err(StoreError::Simulated(_))));
    }
}
