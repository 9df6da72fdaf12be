//! Materialization: turns a standalone event or a flushed album into exactly
//! one durable `ContentRecord`
//!
//! Steps:
//! 1. Fetch every attachment in arrival order (failures skip that item only)
//! 2. Build the record from the first event's text plus the stored media
//! 3. Insert it, retrying transient store errors with bounded backoff
//!
//! Media is fetched once, before the first insert attempt, so retries never
//! re-download.

use super::backoff::ExponentialBackoff;
use super::db::{ContentStore, StoreError};
use super::media::MediaFetcher;
use super::types::{derive_title, ContentEvent, NewContentRecord};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeError {
    /// Nothing to materialize (album already flushed or never filled)
    EmptyGroup,
    /// The store kept failing; the post was dropped
    RetriesExhausted { attempts: u32, last_error: String },
    /// The store refused the write outright (not worth retrying)
    Rejected(StoreError),
}

impl std::fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaterializeError::EmptyGroup => write!(f, "No events to materialize"),
            MaterializeError::RetriesExhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "Store write failed after {} attempts: {}",
                attempts, last_error
            ),
            MaterializeError::Rejected(e) => write!(f, "Store rejected record: {}", e),
        }
    }
}

impl std::error::Error for MaterializeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializeOutcome {
    pub record_id: i64,
    pub media_stored: usize,
    pub media_skipped: usize,
    pub attempts: u32,
}

pub struct Materializer {
    store: Arc<dyn ContentStore>,
    fetcher: Arc<dyn MediaFetcher>,
    retry: RetryPolicy,
    title_max_chars: usize,
}

impl Materializer {
    pub fn new(
        store: Arc<dyn ContentStore>,
        fetcher: Arc<dyn MediaFetcher>,
        retry: RetryPolicy,
        title_max_chars: usize,
    ) -> Self {
        Self {
            store,
            fetcher,
            retry,
            title_max_chars,
        }
    }

    /// Materialize one event that is not part of an album
    pub async fn materialize_standalone(
        &self,
        event: ContentEvent,
    ) -> Result<MaterializeOutcome, MaterializeError> {
        self.materialize(std::slice::from_ref(&event)).await
    }

    /// Materialize a flushed album as a single post
    pub async fn materialize_group(
        &self,
        group_key: &str,
        events: Vec<ContentEvent>,
    ) -> Result<MaterializeOutcome, MaterializeError> {
        log::debug!("🧩 Materializing album {} ({} parts)", group_key, events.len());
        self.materialize(&events).await
    }

    async fn materialize(
        &self,
        events: &[ContentEvent],
    ) -> Result<MaterializeOutcome, MaterializeError> {
        let first = events.first().ok_or(MaterializeError::EmptyGroup)?;

        let (media_urls, media_skipped) = self.collect_media(events).await;
        let media_stored = media_urls.len();

        let text = first.body_text.clone();
        let record = NewContentRecord {
            group_key: first.group_key.clone(),
            author_channel: first.author_channel.clone(),
            source_message_id: first.sequence_id,
            title: derive_title(&text, self.title_max_chars),
            text,
            media_urls,
        };

        let (record_id, attempts) = self.persist(record).await?;

        Ok(MaterializeOutcome {
            record_id,
            media_stored,
            media_skipped,
            attempts,
        })
    }

    /// Fetch all attachments in arrival order; returns (stored urls, skipped count)
    async fn collect_media(&self, events: &[ContentEvent]) -> (Vec<String>, usize) {
        let mut stored = Vec::new();
        let mut skipped = 0;

        for event in events {
            for media in &event.media {
                match self.fetcher.fetch_and_persist(media).await {
                    Ok(local_url) => stored.push(local_url),
                    Err(e) => {
                        skipped += 1;
                        log::warn!(
                            "⚠️  Skipping {:?} {} from {}#{}: {}",
                            media.kind,
                            media.source_url,
                            event.author_channel,
                            event.sequence_id,
                            e
                        );
                    }
                }
            }
        }

        (stored, skipped)
    }

    /// Insert with bounded retries; returns (record id, attempts used)
    async fn persist(&self, record: NewContentRecord) -> Result<(i64, u32), MaterializeError> {
        let mut backoff = ExponentialBackoff::new(
            self.retry.initial_backoff,
            self.retry.max_backoff,
            self.retry.max_retries,
        );
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.store.create_content_record(record.clone()).await {
                Ok(id) => return Ok((id, attempts)),
                Err(e) if !e.is_transient() => return Err(MaterializeError::Rejected(e)),
                Err(e) => {
                    log::warn!("⚠️  Store write attempt {} failed: {}", attempts, e);
                    if backoff.sleep().await.is_err() {
                        return Err(MaterializeError::RetriesExhausted {
                            attempts,
                            last_error: e.to_string(),
                        });
                    }
                }
            }
        }
    }
}
