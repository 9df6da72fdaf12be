//! Engagement deduplication: at most one counted view per (subject, actor)
//! inside the configured window
//!
//! The window slides per pair, not globally: two actors viewing the same
//! subject at the same instant are both counted.

use super::db::{EngagementStore, StoreError};
use super::types::ViewOutcome;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct EngagementDeduplicator {
    store: Arc<dyn EngagementStore>,
    min_interval: chrono::Duration,
}

impl EngagementDeduplicator {
    pub fn new(store: Arc<dyn EngagementStore>, min_interval: chrono::Duration) -> Self {
        Self {
            store,
            min_interval,
        }
    }

    pub fn min_interval(&self) -> chrono::Duration {
        self.min_interval
    }

    /// Record a view of `subject_id` by `actor_id` at `now`
    ///
    /// A view is stored when the pair has no earlier view or the last one is
    /// at least `min_interval` old. `total_count` is read after the decision
    /// either way.
    pub async fn record_view(
        &self,
        subject_id: i64,
        actor_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ViewOutcome, StoreError> {
        // Fast path for repeats; the authoritative check runs inside the
        // store's write transaction below
        let last = self.store.get_last_engagement(subject_id, actor_id).await?;
        // Strict `<`: a repeat exactly `min_interval` later is counted
        // (window-boundary decision in DESIGN.md)
        let within_window = last
            .as_ref()
            .is_some_and(|record| now - record.occurred_at < self.min_interval);

        let recorded = if within_window {
            false
        } else {
            match self
                .store
                .create_engagement_record(subject_id, actor_id, now, self.min_interval)
                .await
            {
                Ok(_) => true,
                Err(StoreError::Conflict(reason)) => {
                    log::debug!("View race lost for {}/{}: {}", subject_id, actor_id, reason);
                    false
                }
                Err(e) => return Err(e),
            }
        };

        let total_count = self.store.count_viewers(subject_id).await?;

        if recorded {
            log::debug!(
                "👁  View recorded: subject={} actor={} total={}",
                subject_id,
                actor_id,
                total_count
            );
        } else {
            log::debug!(
                "👁  Repeat view ignored: subject={} actor={} (last at {:?})",
                subject_id,
                actor_id,
                last.map(|record| record.occurred_at)
            );
        }

        Ok(ViewOutcome {
            recorded,
            total_count,
        })
    }
}
