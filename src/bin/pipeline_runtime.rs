//! Pipeline Runtime
//!
//! Wires the content pipeline end to end:
//! - Opens the SQLite store and applies `/sql` migrations
//! - Builds the media fetcher, materializer, album aggregator and view deduplicator
//! - Spawns the ingestion loop and the JSONL source (stdin or a tailed file)
//! - On CTRL+C or end of input, closes the channel and flushes pending albums
//!
//! Usage:
//!   cargo run --release --bin pipeline_runtime < signals.jsonl
//!   POSTFLOW_SOURCE_PATH=streams/signals.jsonl cargo run --release --bin pipeline_runtime
//!
//! Environment variables: see `PipelineConfig::from_env`.

use dotenv::dotenv;
use log::{error, info, warn};
use postflow::pipeline::{
    config::PipelineConfig,
    db::SqliteStore,
    engagement::EngagementDeduplicator,
    ingestion::{start_ingestion, ContentRouter, IngestError, IngestionListener},
    materializer::{Materializer, RetryPolicy},
    media::HttpMediaFetcher,
    source::{JsonlSource, SourceStats},
    GroupAggregator,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::oneshot;
use tokio::task::JoinError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    info!("🚀 PostFlow pipeline runtime");

    let config = PipelineConfig::from_env();
    config.validate()?;

    info!("✅ Configuration loaded");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Media dir: {}", config.media_dir);
    info!(
        "   ├─ Local media root: {}",
        config.local_media_root.as_deref().unwrap_or("disabled")
    );
    info!(
        "   ├─ Source: {}",
        config.source_path.as_deref().unwrap_or("stdin")
    );
    info!("   ├─ Album window: {}ms", config.album_timeout_ms);
    info!(
        "   ├─ View interval: {}s (max {} in flight)",
        config.min_view_interval_secs, config.max_inflight_views
    );
    info!(
        "   └─ Store retries: {} (backoff {}..{}ms)",
        config.materialize_max_retries, config.backoff_initial_ms, config.backoff_max_ms
    );

    info!("🔧 Initializing database...");
    let store = Arc::new(SqliteStore::open_with_schema(
        &config.db_path,
        &config.schema_dir,
    )?);
    info!("✅ Database initialized");

    let mut fetcher = HttpMediaFetcher::new(&config.media_dir, config.media_fetch_timeout())?;
    if let Some(root) = &config.local_media_root {
        fetcher = fetcher.with_local_root(root)?;
    }
    let fetcher = Arc::new(fetcher);
    let retry = RetryPolicy {
        max_retries: config.materialize_max_retries,
        initial_backoff: Duration::from_millis(config.backoff_initial_ms),
        max_backoff: Duration::from_millis(config.backoff_max_ms),
    };
    let materializer = Arc::new(Materializer::new(
        store.clone(),
        fetcher,
        retry,
        config.title_max_chars,
    ));
    let aggregator = GroupAggregator::new(materializer.clone(), config.album_timeout());
    let dedup = Arc::new(EngagementDeduplicator::new(
        store.clone(),
        config.min_view_interval(),
    ));

    let (listener, rx) = IngestionListener::channel(config.channel_buffer);
    let router = ContentRouter::new(aggregator, materializer, config.redelivery_window);

    let ingestion_handle = tokio::spawn(start_ingestion(rx, router));
    info!("✅ Ingestion task spawned (buffer: {})", config.channel_buffer);

    let (stop_tx, stop_rx) = oneshot::channel();
    let mut source = JsonlSource::new(listener, dedup)
        .with_max_inflight_views(config.max_inflight_views)
        .with_stop(stop_rx);
    let source_path = config.source_path.clone();
    let mut source_handle = tokio::spawn(async move {
        let result = match source_path {
            Some(path) => source.tail(PathBuf::from(path)).await,
            None => source.pump(BufReader::new(tokio::io::stdin())).await,
        };
        // Dropping the source closes the channel
        drop(source);
        result
    });

    info!("🔄 Press CTRL+C to shutdown gracefully");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => warn!("⚠️  Received CTRL+C, shutting down..."),
                Err(e) => error!("❌ Failed to listen for CTRL+C: {}", e),
            }
            // The source drains its in-flight views before returning
            let _ = stop_tx.send(());
            log_source_result(source_handle.await);
        }
        finished = &mut source_handle => log_source_result(finished),
    }

    // The finished source dropped the last sender; ingestion then performs
    // its final flush and returns
    match ingestion_handle.await {
        Ok(stats) => info!(
            "✅ Pipeline runtime stopped ({} events, {} redelivered)",
            stats.received, stats.redelivered
        ),
        Err(e) => error!("❌ Ingestion task failed: {}", e),
    }

    Ok(())
}

fn log_source_result(finished: Result<Result<SourceStats, IngestError>, JoinError>) {
    match finished {
        Ok(Ok(stats)) => info!(
            "📭 Source finished ({} content, {} views)",
            stats.content, stats.views
        ),
        Ok(Err(e)) => warn!("⚠️  Source stopped: {}", e),
        Err(e) => error!("❌ Source task failed: {}", e),
    }
}
