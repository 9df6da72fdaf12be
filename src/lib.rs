//! PostFlow: turns a live stream of channel messages into durable posts and
//! records deduplicated view events.
//!
//! See [`pipeline`] for the ingestion, album aggregation and engagement
//! components, and `src/bin/pipeline_runtime.rs` for the production wiring.

pub mod pipeline;
pub mod sqlite_pragma;
