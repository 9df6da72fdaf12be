//! # Content Pipeline
//!
//! Turns a stream of broadcast messages into durable posts and keeps
//! engagement counters honest.
//!
//! ## Data flow
//!
//! ```text
//! JsonlSource ─┬─ content ──▶ IngestionListener ──▶ ContentRouter ─┬─ standalone ──▶ Materializer
//!              │                                                   └─ album part ──▶ GroupAggregator ──(timer)──▶ Materializer
//!              └─ view ─────▶ EngagementDeduplicator                                                                │
//!                                   │                                                                               ▼
//!                                   └──────────────────────────────▶ SqliteStore ◀───────────────────────────────────┘
//! ```
//!
//! - Album parts share a `group_key`; the first part arms a fixed debounce
//!   timer and everything that arrives before it fires becomes one post.
//! - Media is fetched into local storage before the post that references it
//!   is written. Unreachable media is skipped, not fatal.
//! - Store writes are retried with bounded backoff, then the post is dropped
//!   and logged at error level.
//! - A view is counted once per (subject, actor) per `MIN_VIEW_INTERVAL_SECS`.
//!
//! ## Schema Reference
//!
//! Tables are created from `/sql/*.sql` in file-name order:
//! - `content_records` → `ContentRecord`
//! - `engagement_records` → `EngagementRecord`
//! - `likes`, `comments` → `SubjectStats`, `Comment`
//!
//! ## Module Organization
//!
//! - `types` - Inbound events and durable records
//! - `config` - Environment-driven settings
//! - `db` - Store traits and the SQLite implementation
//! - `backoff` - Retry delays
//! - `media` - Attachment fetching
//! - `scheduler` - Keyed one-shot timers
//! - `materializer` - Event(s) → one `ContentRecord`
//! - `aggregator` - Album buffering and flush
//! - `engagement` - View deduplication
//! - `redelivery` - Recently-seen event ids
//! - `ingestion` - Listener and routing loop
//! - `source` - JSONL input from stdin or a tailed file

pub mod aggregator;
pub mod backoff;
pub mod config;
pub mod db;
pub mod engagement;
pub mod ingestion;
pub mod materializer;
pub mod media;
pub mod redelivery;
pub mod scheduler;
pub mod source;
pub mod types;

pub use aggregator::GroupAggregator;
pub use config::PipelineConfig;
pub use db::{ContentStore, EngagementStore, SqliteStore, StoreError};
pub use engagement::EngagementDeduplicator;
pub use ingestion::{start_ingestion, ContentRouter, IngestError, IngestionListener, IngestionStats};
pub use materializer::{Materializer, RetryPolicy};
pub use media::{HttpMediaFetcher, MediaFetcher};
pub use source::JsonlSource;
pub use types::{ContentEvent, ContentRecord, InboundSignal, MediaKind, MediaReference, ViewOutcome};
