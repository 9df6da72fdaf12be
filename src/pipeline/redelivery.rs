//! Bounded memory of recently seen event identities
//!
//! The source may redeliver a message it already handed us (reconnects,
//! replays). Anything still in the window is dropped; anything older has been
//! evicted and will be processed again.

use super::types::EventIdentity;
use std::collections::{HashSet, VecDeque};

pub struct RedeliveryFilter {
    capacity: usize,
    seen: HashSet<EventIdentity>,
    order: VecDeque<EventIdentity>,
}

impl RedeliveryFilter {
    /// `capacity` of 0 disables the filter (every event passes)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns true the first time `id` is seen, false for a redelivery
    pub fn check_and_record(&mut self, id: &EventIdentity) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.seen.contains(id) {
            return false;
        }

        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.clone());
        self.order.push_back(id.clone());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(channel: &str, seq: i64) -> EventIdentity {
        EventIdentity {
            author_channel: channel.to_string(),
            sequence_id: seq,
        }
    }

    #[test]
    fn test_repeat_within_window_rejected() {
        let mut filter = RedeliveryFilter::new(8);
        assert!(filter.check_and_record(&id("news", 1)));
        assert!(!filter.check_and_record(&id("news", 1)));
        // Same ordinal on another channel is a different message
        assert!(filter.check_and_record(&id("sport", 1)));
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let mut filter = RedeliveryFilter::new(2);
        assert!(filter.check_and_record(&id("news", 1)));
        assert!(filter.check_and_record(&id("news", 2)));
        assert!(filter.check_and_record(&id("news", 3)));

        assert_eq!(filter.len(), 2);
        assert!(!filter.check_and_record(&id("news", 3)));
        // Fell out of the window, so it passes again
        assert!(filter.check_and_record(&id("news", 1)));
    }

    #[test]
    fn test_zero_capacity_disables() {
        let mut filter = RedeliveryFilter::new(0);
        assert!(filter.check_and_record(&id("news", 1)));
        assert!(filter.check_and_record(&id("news", 1)));
        assert!(filter.is_empty());
    }
}
