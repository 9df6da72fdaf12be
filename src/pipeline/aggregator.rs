//! Album aggregation: buffers multi-part posts until their debounce window
//! closes, then materializes each album exactly once
//!
//! ## Lifecycle per group key
//!
//! ```text
//! absent ──first part──▶ collecting ──more parts──▶ collecting
//!                            │
//!                       timer fires (created_at + album_timeout, never reset)
//!                            ▼
//!                        flushing ──done / retries exhausted──▶ absent
//! ```
//!
//! The buffer is removed from the map under its shard lock at the moment the
//! timer fires. A part arriving after that point finds no buffer and opens a
//! fresh group under the same key with its own timer.
//!
//! The map is split into shards (by key hash), each behind its own mutex, so
//! unrelated albums rarely contend. Locks are never held across an await.

use super::materializer::Materializer;
use super::scheduler::FlushScheduler;
use super::types::ContentEvent;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

const SHARD_COUNT: usize = 16;

/// Parts of one album collected so far
#[derive(Debug)]
pub struct PendingGroup {
    pub events: Vec<ContentEvent>,
    pub created_at: Instant,
    pub deadline: Instant,
    generation: u64,
}

type Shard = Mutex<HashMap<String, PendingGroup>>;

struct AggregatorInner {
    shards: Vec<Shard>,
    scheduler: FlushScheduler<String>,
    materializer: Arc<Materializer>,
    album_timeout: Duration,
    next_generation: AtomicU64,
    flushed: AtomicU64,
    dropped: AtomicU64,
}

/// Cheap to clone; all clones share the same buffers and timers
#[derive(Clone)]
pub struct GroupAggregator {
    inner: Arc<AggregatorInner>,
}

impl GroupAggregator {
    pub fn new(materializer: Arc<Materializer>, album_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
                scheduler: FlushScheduler::new(),
                materializer,
                album_timeout,
                next_generation: AtomicU64::new(1),
                flushed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Buffer one album part; arms the flush timer if this is the first part
    ///
    /// Never blocks beyond a shard lock. Events without a group key are
    /// ignored (the router sends those down the standalone path).
    pub fn accept(&self, event: ContentEvent) {
        let Some(key) = event.group_key.clone() else {
            log::warn!(
                "⚠️  Event {}#{} has no group key, not buffering",
                event.author_channel,
                event.sequence_id
            );
            return;
        };

        let mut shard = self.inner.shard(&key);

        if let Some(group) = shard.get_mut(&key) {
            group.events.push(event);
            log::debug!("📎 Album {}: part {} buffered", key, group.events.len());
            return;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        shard.insert(
            key.clone(),
            PendingGroup {
                events: vec![event],
                created_at: now,
                deadline: now + self.inner.album_timeout,
                generation,
            },
        );

        let inner = self.inner.clone();
        let flush_key = key.clone();
        self.inner.scheduler.schedule(key.clone(), self.inner.album_timeout, async move {
            inner.flush(&flush_key, generation).await;
        });

        log::debug!(
            "🆕 Album {}: collecting for {}ms",
            key,
            self.inner.album_timeout.as_millis()
        );
    }

    pub fn pending_groups(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|shard| lock_shard(shard).len())
            .sum()
    }

    /// Number of buffered parts for `key` (0 if nothing is pending)
    pub fn pending_parts(&self, key: &str) -> usize {
        self.inner
            .shard(key)
            .get(key)
            .map(|group| group.events.len())
            .unwrap_or(0)
    }

    /// Albums written to the store so far
    pub fn flushed_groups(&self) -> u64 {
        self.inner.flushed.load(Ordering::Relaxed)
    }

    /// Albums given up on after their store retries ran out
    pub fn dropped_groups(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Flush every pending album now and wait until all flushes are done
    ///
    /// Best effort: albums whose store writes keep failing are still dropped.
    pub async fn shutdown(&self) {
        let pending = self.pending_groups();
        if pending > 0 {
            log::info!("🔄 Flushing {} pending albums before shutdown", pending);
        }
        self.inner.scheduler.shutdown().await;
    }
}

fn lock_shard(shard: &Shard) -> MutexGuard<'_, HashMap<String, PendingGroup>> {
    shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AggregatorInner {
    fn shard(&self, key: &str) -> MutexGuard<'_, HashMap<String, PendingGroup>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        lock_shard(&self.shards[index])
    }

    /// Timer callback: pop the buffer (exactly once) and materialize it
    async fn flush(&self, key: &str, generation: u64) {
        let group = {
            let mut shard = self.shard(key);
            let current = shard
                .get(key)
                .is_some_and(|group| group.generation == generation);
            if current {
                shard.remove(key)
            } else {
                None
            }
        };

        let Some(group) = group else {
            log::debug!("Album {}: nothing pending at flush, skipping", key);
            return;
        };

        let parts = group.events.len();
        let waited = group.created_at.elapsed();
        let now = Instant::now();
        if now < group.deadline {
            log::debug!(
                "⏩ Album {}: flushing {}ms before its deadline",
                key,
                (group.deadline - now).as_millis()
            );
        }

        match self.materializer.materialize_group(key, group.events).await {
            Ok(outcome) => {
                self.flushed.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "✅ Album {} saved: {} parts → record {} ({} media, {} skipped, waited {}ms)",
                    key,
                    parts,
                    outcome.record_id,
                    outcome.media_stored,
                    outcome.media_skipped,
                    waited.as_millis()
                );
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::error!("❌ Album {} dropped ({} parts): {}", key, parts, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::materializer::tests::{event, fast_retry, FlakyStore, StubFetcher};
    use crate::pipeline::types::MediaReference;
    use tokio::time::sleep;

    fn make_aggregator(store: Arc<FlakyStore>, timeout_ms: u64, retries: u32) -> GroupAggregator {
        let materializer = Arc::new(Materializer::new(
            store,
            Arc::new(StubFetcher),
            fast_retry(retries),
            50,
        ));
        GroupAggregator::new(materializer, Duration::from_millis(timeout_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn test_album_parts_merge_into_one_record() {
        let store = Arc::new(FlakyStore::new(0));
        let aggregator = make_aggregator(store.clone(), 2_000, 0);

        aggregator.accept(event(Some("g1"), 1, "Hello", vec![MediaReference::photo("photo1")]));
        sleep(Duration::from_millis(300)).await;
        aggregator.accept(event(Some("g1"), 2, "", vec![]));
        sleep(Duration::from_millis(300)).await;
        aggregator.accept(event(Some("g1"), 3, "", vec![MediaReference::video("video1")]));

        assert_eq!(aggregator.pending_groups(), 1);
        assert_eq!(aggregator.pending_parts("g1"), 3);

        // Deadline is 2.0s after the first part, not after the last one
        sleep(Duration::from_millis(1_350)).await;
        assert!(store.records().is_empty());

        sleep(Duration::from_millis(100)).await;
        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "Hello");
        assert_eq!(records[0].media_urls, vec!["stored/photo1", "stored/video1"]);
        assert_eq!(aggregator.pending_groups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_part_starts_new_group() {
        let store = Arc::new(FlakyStore::new(0));
        let aggregator = make_aggregator(store.clone(), 2_000, 0);

        aggregator.accept(event(Some("g1"), 1, "first", vec![MediaReference::photo("a")]));
        sleep(Duration::from_millis(2_100)).await;
        assert_eq!(store.records().len(), 1);

        aggregator.accept(event(Some("g1"), 2, "late", vec![MediaReference::photo("b")]));
        assert_eq!(aggregator.pending_parts("g1"), 1);

        sleep(Duration::from_millis(2_100)).await;
        let records = store.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].media_urls, vec!["stored/a"]);
        assert_eq!(records[1].text, "late");
        assert_eq!(records[1].media_urls, vec!["stored/b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_groups_flush_separately() {
        let store = Arc::new(FlakyStore::new(0));
        let aggregator = make_aggregator(store.clone(), 1_000, 0);

        aggregator.accept(event(Some("a"), 1, "album a", vec![]));
        aggregator.accept(event(Some("b"), 2, "album b", vec![]));
        aggregator.accept(event(Some("a"), 3, "", vec![]));
        assert_eq!(aggregator.pending_groups(), 2);

        sleep(Duration::from_millis(1_100)).await;
        let mut texts: Vec<_> = store.records().into_iter().map(|r| r.text).collect();
        texts.sort();
        assert_eq!(texts, vec!["album a", "album b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_drop_group() {
        let store = Arc::new(FlakyStore::new(u32::MAX));
        let aggregator = make_aggregator(store.clone(), 500, 2);

        aggregator.accept(event(Some("doomed"), 1, "x", vec![]));
        sleep(Duration::from_secs(5)).await;

        assert!(store.records().is_empty());
        assert_eq!(aggregator.pending_groups(), 0);
        assert_eq!(aggregator.dropped_groups(), 1);
        assert_eq!(
            store.calls.load(std::sync::atomic::Ordering::SeqCst),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_group_does_not_affect_others() {
        let store = Arc::new(FlakyStore::failing_for("doomed"));
        let aggregator = make_aggregator(store.clone(), 500, 2);

        aggregator.accept(event(Some("doomed"), 1, "never stored", vec![]));
        aggregator.accept(event(Some("healthy"), 2, "stored", vec![MediaReference::photo("p")]));
        aggregator.accept(event(Some("doomed"), 3, "", vec![]));
        aggregator.accept(event(Some("healthy"), 4, "", vec![]));

        sleep(Duration::from_secs(5)).await;

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].group_key.as_deref(), Some("healthy"));
        assert_eq!(records[0].text, "stored");
        assert_eq!(records[0].media_urls, vec!["stored/p"]);
        assert!(records.iter().all(|r| r.group_key.as_deref() != Some("doomed")));

        assert_eq!(aggregator.flushed_groups(), 1);
        assert_eq!(aggregator.dropped_groups(), 1);
        assert_eq!(aggregator.pending_groups(), 0);
        // One attempt plus two retries for the failing album, one for the other
        assert_eq!(store.rejected.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(store.calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending() {
        let store = Arc::new(FlakyStore::new(0));
        let aggregator = make_aggregator(store.clone(), 60_000, 0);

        aggregator.accept(event(Some("g1"), 1, "one", vec![]));
        aggregator.accept(event(Some("g2"), 2, "two", vec![]));

        let start = Instant::now();
        aggregator.shutdown().await;

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(store.records().len(), 2);
        assert_eq!(aggregator.flushed_groups(), 2);
        assert_eq!(aggregator.pending_groups(), 0);
    }

    #[tokio::test]
    async fn test_stale_generation_flush_is_noop() {
        let store = Arc::new(FlakyStore::new(0));
        let aggregator = make_aggregator(store.clone(), 60_000, 0);

        aggregator.accept(event(Some("g1"), 1, "one", vec![]));
        aggregator.inner.flush("g1", u64::MAX).await;
        aggregator.inner.flush("missing", 1).await;

        assert_eq!(aggregator.pending_parts("g1"), 1);
        assert!(store.records().is_empty());
        aggregator.shutdown().await;
        assert_eq!(store.records().len(), 1);
    }
}
