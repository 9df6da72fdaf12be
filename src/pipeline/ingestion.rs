//! Ingestion: the non-blocking entry point for content events and the loop
//! that routes them
//!
//! ```text
//! source ──on_event──▶ mpsc ──▶ start_ingestion ─┬─ no group key ──▶ spawned materialization
//!                                                └─ group key ─────▶ GroupAggregator::accept
//! ```
//!
//! When the channel closes the loop flushes every pending album and waits for
//! in-flight standalone posts before returning.

use super::aggregator::GroupAggregator;
use super::materializer::Materializer;
use super::redelivery::RedeliveryFilter;
use super::types::ContentEvent;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// The routing loop has stopped; nothing more can be accepted
    ChannelClosed,
    /// An inbound line could not be decoded
    Parse(String),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::ChannelClosed => write!(f, "Ingestion channel closed"),
            IngestError::Parse(e) => write!(f, "Parse error: {}", e),
        }
    }
}

impl std::error::Error for IngestError {}

/// Sending half handed to event sources
#[derive(Clone)]
pub struct IngestionListener {
    tx: mpsc::Sender<ContentEvent>,
}

impl IngestionListener {
    /// Create a listener and the receiver to pass to `start_ingestion`
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ContentEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Hand one event to the router without waiting
    ///
    /// If the channel is full the send is moved to a background task so the
    /// caller's delivery thread is never parked on back-pressure.
    pub fn on_event(&self, event: ContentEvent) -> Result<(), IngestError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                log::warn!(
                    "⚠️  Ingestion channel full ({} slots), deferring {}#{}",
                    self.tx.max_capacity(),
                    event.author_channel,
                    event.sequence_id
                );
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = tx.send(event).await {
                        log::error!(
                            "❌ Event {}#{} lost: channel closed while deferred",
                            e.0.author_channel,
                            e.0.sequence_id
                        );
                    }
                });
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(IngestError::ChannelClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Where `ContentRouter::route` sent an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Standalone,
    Grouped,
    Redelivered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionStats {
    pub received: u64,
    pub standalone: u64,
    pub grouped: u64,
    pub redelivered: u64,
}

pub struct ContentRouter {
    aggregator: GroupAggregator,
    materializer: Arc<Materializer>,
    redelivery: RedeliveryFilter,
    standalone: JoinSet<()>,
}

impl ContentRouter {
    pub fn new(
        aggregator: GroupAggregator,
        materializer: Arc<Materializer>,
        redelivery_window: usize,
    ) -> Self {
        Self {
            aggregator,
            materializer,
            redelivery: RedeliveryFilter::new(redelivery_window),
            standalone: JoinSet::new(),
        }
    }

    pub fn aggregator(&self) -> &GroupAggregator {
        &self.aggregator
    }

    /// Dispatch one event; standalone posts start materializing immediately
    pub fn route(&mut self, event: ContentEvent) -> Routed {
        if !self.redelivery.check_and_record(&event.identity()) {
            log::debug!(
                "🔁 Redelivered {}#{} dropped",
                event.author_channel,
                event.sequence_id
            );
            return Routed::Redelivered;
        }

        if event.is_grouped() {
            self.aggregator.accept(event);
            return Routed::Grouped;
        }

        let materializer = self.materializer.clone();
        self.standalone.spawn(async move {
            let label = format!("{}#{}", event.author_channel, event.sequence_id);
            match materializer.materialize_standalone(event).await {
                Ok(outcome) => log::info!(
                    "✅ Post {} saved → record {} ({} media, {} skipped)",
                    label,
                    outcome.record_id,
                    outcome.media_stored,
                    outcome.media_skipped
                ),
                Err(e) => log::error!("❌ Post {} dropped: {}", label, e),
            }
        });
        Routed::Standalone
    }

    /// Flush pending albums and wait for every spawned materialization
    pub async fn finish(&mut self) {
        self.aggregator.shutdown().await;

        while let Some(joined) = self.standalone.join_next().await {
            if let Err(e) = joined {
                log::error!("❌ Standalone materialization task failed: {}", e);
            }
        }
    }
}

/// Route events from `rx` until every sender is dropped
///
/// Returns once the final flush has completed.
pub async fn start_ingestion(
    mut rx: mpsc::Receiver<ContentEvent>,
    mut router: ContentRouter,
) -> IngestionStats {
    log::info!("🚀 Starting content ingestion");
    log::info!("   └─ Waiting for events...");

    let mut stats = IngestionStats::default();
    let mut window_count = 0u64;
    let mut last_log_time = std::time::Instant::now();

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else {
                    log::warn!("⚠️  Event channel closed, stopping ingestion");
                    break;
                };

                stats.received += 1;
                match router.route(event) {
                    Routed::Standalone => stats.standalone += 1,
                    Routed::Grouped => stats.grouped += 1,
                    Routed::Redelivered => stats.redelivered += 1,
                }

                window_count += 1;
                if last_log_time.elapsed().as_secs() >= 10 {
                    let per_sec = window_count as f64 / last_log_time.elapsed().as_secs_f64();
                    log::info!(
                        "📊 Ingestion rate: {:.1} events/sec (total: {}, pending albums: {})",
                        per_sec,
                        stats.received,
                        router.aggregator().pending_groups()
                    );
                    last_log_time = std::time::Instant::now();
                    window_count = 0;
                }
            }

            Some(joined) = router.standalone.join_next(), if !router.standalone.is_empty() => {
                if let Err(e) = joined {
                    log::error!("❌ Standalone materialization task failed: {}", e);
                }
            }
        }
    }

    log::info!("🔄 Performing final flush...");
    router.finish().await;

    log::info!(
        "✅ Ingestion stopped: {} events ({} standalone, {} album parts, {} redelivered)",
        stats.received,
        stats.standalone,
        stats.grouped,
        stats.redelivered
    );
    stats
}
