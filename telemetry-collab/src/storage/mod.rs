//! Persistence collaborators for stories.
//!
//! ```text
//! ┌─────────────┐   fetch on load    ┌──────────────────┐
//! │ Room task   │ ─────────────────► │ dyn StoryStore   │
//! │ (per story) │ ◄───────────────── │                  │
//! └─────────────┘   push (debounced) └────────┬─────────┘
//!                                             │
//!                 ┌───────────────────────────┼───────────────────────┐
//!                 ▼                           ▼                       ▼
//!         HttpStoryStore              RocksStoryStore          MemoryStoryStore
//!         (blog API)                  (LZ4 + metadata CF)      (tests, fault injection)
//! ```
//!
//! Only the derived projection of a story crosses this boundary; the CRDT
//! state itself is never persisted.

pub mod http;
pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use telemetry_core::StorySnapshot;
use thiserror::Error;

pub use http::{HttpStoreConfig, HttpStoryStore};
pub use memory::MemoryStoryStore;
pub use rocks::{RocksStoryStore, StoreConfig, StoryMetadata};

/// A story as the store hands it out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryRecord {
    /// Stored markup.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub word_count: usize,
    /// First author; numeric IDs are accepted and kept as text.
    #[serde(default, deserialize_with = "string_or_number")]
    pub author_id: Option<String>,
}

impl StoryRecord {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_author(mut self, author_id: impl Into<String>) -> Self {
        self.author_id = Some(author_id.into());
        self
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }
    Ok(Option::<Id>::deserialize(deserializer)?.map(|id| match id {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    }))
}

/// Partial update pushed to the store; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoryUpdate {
    pub content: Option<String>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub word_count: Option<usize>,
    pub is_published: Option<bool>,
}

impl StoryUpdate {
    /// Publish-state toggle on its own.
    pub fn published(is_published: bool) -> Self {
        Self {
            is_published: Some(is_published),
            ..Self::default()
        }
    }

    /// Merge this update into a record.
    pub fn apply_to(&self, record: &mut StoryRecord) {
        if let Some(content) = &self.content {
            record.content = content.clone();
        }
        if let Some(title) = &self.title {
            record.title = Some(title.clone());
        }
        if let Some(subtitle) = &self.subtitle {
            record.subtitle = Some(subtitle.clone());
        }
        if let Some(word_count) = self.word_count {
            record.word_count = word_count;
        }
    }
}

impl From<StorySnapshot> for StoryUpdate {
    fn from(snapshot: StorySnapshot) -> Self {
        Self {
            content: Some(snapshot.content),
            title: snapshot.title,
            subtitle: snapshot.subtitle,
            word_count: Some(snapshot.word_count),
            is_published: None,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("story not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("store rejected request with status {0}")]
    Status(u16),
    /// Injected by [`MemoryStoryStore`].
    #[error("simulated failure: {0}")]
    Simulated(String),
}

/// Where stories are loaded from and snapshots pushed to.
#[async_trait]
pub trait StoryStore: Send + Sync {
    /// Load a story; `Ok(None)` if it does not exist.
    async fn fetch(&self, id: &str) -> Result<Option<StoryRecord>, StoreError>;

    /// Apply a partial update to a story.
    async fn push(&self, id: &str, update: StoryUpdate) -> Result<(), StoreError>;
}
