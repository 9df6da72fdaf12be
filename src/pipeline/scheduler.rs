//! Keyed one-shot timers for debounced flushes
//!
//! Each armed timer is a spawned task that waits out its delay (or an early
//! "fire now" from `shutdown`) and then runs its callback. Timers are never
//! extended: re-arming a key that is already armed leaves the first deadline
//! in place and starts an independent timer.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::AbortHandle;

struct ArmedTimer {
    timer_id: u64,
    fire_now: oneshot::Sender<()>,
    abort: AbortHandle,
}

struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count when a timer task ends (completed, fired
/// early, aborted or panicked)
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub struct FlushScheduler<K> {
    timers: Arc<Mutex<HashMap<K, ArmedTimer>>>,
    next_timer_id: AtomicU64,
    in_flight: Arc<InFlight>,
}

impl<K> FlushScheduler<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_timer_id: AtomicU64::new(1),
            in_flight: Arc::new(InFlight {
                count: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    fn lock_timers(timers: &Mutex<HashMap<K, ArmedTimer>>) -> MutexGuard<'_, HashMap<K, ArmedTimer>> {
        timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `callback` once `delay` has elapsed
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, key: K, delay: Duration, callback: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timer_id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let (fire_tx, fire_rx) = oneshot::channel::<()>();

        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard(self.in_flight.clone());
        let timers = self.timers.clone();
        let task_key = key.clone();

        // Hold the map lock across spawn so the task cannot deregister
        // before it has been registered
        let mut armed = Self::lock_timers(&self.timers);

        let handle = tokio::spawn(async move {
            let _guard = guard;

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            tokio::select! {
                _ = &mut sleep => {}
                fired = fire_rx => {
                    // Sender dropped without firing: superseded entry, keep waiting
                    if fired.is_err() {
                        sleep.await;
                    }
                }
            }

            {
                let mut armed = Self::lock_timers(&timers);
                if armed.get(&task_key).map(|t| t.timer_id) == Some(timer_id) {
                    armed.remove(&task_key);
                }
            }

            callback.await;
        });

        armed.insert(
            key,
            ArmedTimer {
                timer_id,
                fire_now: fire_tx,
                abort: handle.abort_handle(),
            },
        );
    }

    /// Disarm the timer for `key` without running its callback
    ///
    /// Returns false if nothing was armed (already fired or never scheduled).
    pub fn cancel(&self, key: &K) -> bool {
        match Self::lock_timers(&self.timers).remove(key) {
            Some(timer) => {
                timer.abort.abort();
                true
            }
            None => false,
        }
    }

    pub fn armed_count(&self) -> usize {
        Self::lock_timers(&self.timers).len()
    }

    /// Timer tasks still running (armed or executing their callback)
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Fire every armed timer now and wait for all callbacks to finish
    pub async fn shutdown(&self) {
        let armed: Vec<ArmedTimer> = Self::lock_timers(&self.timers)
            .drain()
            .map(|(_, timer)| timer)
            .collect();

        if !armed.is_empty() {
            log::info!("⏩ Firing {} pending timers early for shutdown", armed.len());
        }
        for timer in armed {
            let _ = timer.fire_now.send(());
        }

        self.wait_idle().await;
    }

    /// Wait until no timer task is running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl<K> Default for FlushScheduler<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Instant};

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let scheduler = FlushScheduler::<String>::new();
        let fired = Arc::new(Mutex::new(None));
        let start = Instant::now();

        let fired_clone = fired.clone();
        scheduler.schedule("g1".to_string(), Duration::from_secs(2), async move {
            *fired_clone.lock().unwrap() = Some(Instant::now());
        });
        assert_eq!(scheduler.armed_count(), 1);

        sleep(Duration::from_millis(1_999)).await;
        assert!(fired.lock().unwrap().is_none());

        sleep(Duration::from_millis(10)).await;
        let at = fired.lock().unwrap().unwrap();
        let elapsed = at.duration_since(start);
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_millis(2_005));
        assert_eq!(scheduler.armed_count(), 0);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_callback() {
        let scheduler = FlushScheduler::<String>::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        scheduler.schedule("g1".to_string(), Duration::from_secs(1), async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(scheduler.cancel(&"g1".to_string()));
        assert!(!scheduler.cancel(&"g1".to_string()));

        sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        scheduler.wait_idle().await;
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fires_early_and_waits() {
        let scheduler = FlushScheduler::<u32>::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for key in 0..3 {
            let fired_clone = fired.clone();
            scheduler.schedule(key, Duration::from_secs(3600), async move {
                sleep(Duration::from_millis(50)).await;
                fired_clone.fetch_add(1, Ordering::SeqCst);
            });
        }

        let start = Instant::now();
        scheduler.shutdown().await;

        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(scheduler.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_does_not_extend_first_deadline() {
        let scheduler = FlushScheduler::<&'static str>::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        for (label, delay) in [("first", 2), ("second", 5)] {
            let fired_clone = fired.clone();
            scheduler.schedule("g1", Duration::from_secs(delay), async move {
                fired_clone.lock().unwrap().push((label, Instant::now()));
            });
        }

        sleep(Duration::from_secs(6)).await;
        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].0, "first");
        let first_at = fired[0].1.duration_since(start);
        assert!(first_at >= Duration::from_secs(2) && first_at < Duration::from_millis(2_005));
        assert_eq!(fired[1].0, "second");
    }
}
