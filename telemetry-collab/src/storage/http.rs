//! Story store backed by the blog's HTTP API.
//!
//! - `GET  {base}/api/story/{id}`        → JSON [`StoryRecord`] (404 = missing)
//! - `POST {base}/api/story/{id}/update` ← form fields of a [`StoryUpdate`]

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

use super::{StoreError, StoryRecord, StoryStore, StoryUpdate};

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Scheme and host of the blog, without trailing slash.
    pub base_url: String,
    /// Sent as `Authorization: Bearer …` when set.
    pub token: Option<String>,
    pub timeout: Duration,
}

impl HttpStoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct HttpStoryStore {
    config: HttpStoreConfig,
    client: reqwest::Client,
}

impl HttpStoryStore {
    pub fn new(config: HttpStoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Http(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn story_url(&self, id: &str) -> String {
        format!("{}/api/story/{id}", self.config.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Form body of an update; unset fields are omitted.
pub(crate) fn update_form(update: &StoryUpdate) -> Vec<(&'static str, String)> {
    let mut form = Vec::new();
    if let Some(content) = &update.content {
        form.push(("content", content.clone()));
    }
    if let Some(title) = &update.title {
        form.push(("title", title.clone()));
    }
    if let Some(subtitle) = &update.subtitle {
        form.push(("subtitle", subtitle.clone()));
    }
    if let Some(word_count) = update.word_count {
        form.push(("wordCount", word_count.to_string()));
    }
    if let Some(is_published) = update.is_published {
        form.push(("isPublished", is_published.to_string()));
    }
    form
}

#[async_trait]
impl StoryStore for HttpStoryStore {
    async fn fetch(&self, id: &str) -> Result<Option<StoryRecord>, StoreError> {
        let response = self
            .authorize(self.client.get(self.story_url(id)))
            .send()
            .await
            .map_err(|e| StoreError::Http(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let record = response
                    .json::<StoryRecord>()
                    .await
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                Ok(Some(record))
            }
            status => Err(StoreError::Status(status.as_u16())),
        }
    }

    async fn push(&self, id: &str, update: StoryUpdate) -> Result<(), StoreError> {
        let url = format!("{}/update", self.story_url(id));
        let response = self
            .authorize(self.client.post(url))
            .form(&update_form(&update))
            .send()
            .await
            .map_err(|e| StoreError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Status(response.status().as_u16()));
        }
        log::debug!("pushed story {id} ({} bytes of content)", update.content.map_or(0, |c| c.len()));
        Ok(())
    }
}
