//! Recon work queue: a deduplicating FIFO of string keys with per-key in-flight
//! exclusivity, delayed adds and rate-limited retries.
//!
//! A key handed out by [`RateLimitingQueue::get`] is "processing" until
//! [`RateLimitingQueue::done`] is called for it. Adds for a processing key are
//! remembered (the key is "dirty") and the key is queued again on `done`, so no
//! two workers ever hold the same key at once.

#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

pub mod rate_limit;

pub use rate_limit::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimiter, RateLimiterConfig,
};

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    /// Keys that need processing: queued, or added again while processing.
    dirty: FxHashSet<String>,
    processing: FxHashSet<String>,
    /// Earliest ready time per delayed key; heap entries not matching it are stale.
    waiting: FxHashMap<String, Instant>,
    heap: BinaryHeap<Reverse<(Instant, u64, String)>>,
    seq: u64,
    added_at: FxHashMap<String, Instant>,
    started_at: FxHashMap<String, Instant>,
    shutting_down: bool,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    ready: Notify,
    delay_wake: Notify,
    limiter: Box<dyn RateLimiter>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true when a waiter should be woken.
    fn add_locked(&self, st: &mut State, key: String) -> bool {
        if st.shutting_down || st.dirty.contains(&key) {
            return false;
        }
        counter!("workqueue_adds_total", 1u64, "name" => self.name.clone());
        st.dirty.insert(key.clone());
        if st.processing.contains(&key) {
            return false;
        }
        st.added_at.entry(key.clone()).or_insert_with(Instant::now);
        st.queue.push_back(key);
        gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.name.clone());
        true
    }
}

/// Cloneable handle; clones share the same queue.
#[derive(Clone)]
pub struct RateLimitingQueue {
    inner: Arc<Inner>,
}

impl RateLimitingQueue {
    /// Create a queue and start its delay loop. Must be called from within a Tokio
    /// runtime; the loop stops when the queue is shut down.
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter + 'static) -> Self {
        let inner = Arc::new(Inner {
            name: name.into(),
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            delay_wake: Notify::new(),
            limiter: Box::new(limiter),
        });
        tokio::spawn(run_delays(Arc::clone(&inner)));
        Self { inner }
    }

    pub fn with_default_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue `key` unless it is already waiting. Order of already-queued keys is kept.
    pub fn add(&self, key: impl Into<String>) {
        let wake = {
            let mut st = self.inner.lock();
            self.inner.add_locked(&mut st, key.into())
        };
        if wake {
            self.inner.ready.notify_one();
        }
    }

    /// Queue `key` once `delay` has elapsed. Pending delayed adds for the same key
    /// are merged, keeping the earliest ready time.
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            return self.add(key);
        }
        {
            let mut st = self.inner.lock();
            if st.shutting_down {
                return;
            }
            let at = Instant::now() + delay;
            if matches!(st.waiting.get(&key), Some(existing) if *existing <= at) {
                return;
            }
            st.seq = st.seq.wrapping_add(1);
            let seq = st.seq;
            st.waiting.insert(key.clone(), at);
            st.heap.push(Reverse((at, seq, key)));
        }
        self.inner.delay_wake.notify_one();
    }

    /// Queue `key` after the rate limiter's backoff for it; counts as one failure.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = self.inner.limiter.when(&key);
        counter!("workqueue_retries_total", 1u64, "name" => self.inner.name.clone());
        debug!(queue = %self.inner.name, key = %key, delay_ms = delay.as_millis() as u64, "rate-limited requeue");
        self.add_after(key, delay);
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.inner.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.queue.pop_front() {
                    st.processing.insert(key.clone());
                    st.dirty.remove(&key);
                    let now = Instant::now();
                    if let Some(at) = st.added_at.remove(&key) {
                        histogram!(
                            "workqueue_queue_duration_ms",
                            now.saturating_duration_since(at).as_secs_f64() * 1000.0,
                            "name" => self.inner.name.clone()
                        );
                    }
                    st.started_at.insert(key.clone(), now);
                    gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.inner.name.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release `key`. If it was added while processing it is queued again.
    pub fn done(&self, key: &str) {
        let wake = {
            let mut st = self.inner.lock();
            st.processing.remove(key);
            if let Some(at) = st.started_at.remove(key) {
                histogram!(
                    "workqueue_work_duration_ms",
                    at.elapsed().as_secs_f64() * 1000.0,
                    "name" => self.inner.name.clone()
                );
            }
            if !st.shutting_down && st.dirty.contains(key) {
                st.added_at.entry(key.to_string()).or_insert_with(Instant::now);
                st.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if wake {
            self.inner.ready.notify_one();
        }
    }

    /// Reset the failure count for `key`.
    pub fn forget(&self, key: &str) {
        self.inner.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Number of keys queued and not yet handed out.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys waiting on a delayed add.
    pub fn delayed_len(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Stop handing out keys: pending and future `get` calls return `None`,
    /// adds are ignored, delayed entries are discarded.
    pub fn shut_down(&self) {
        {
            let mut st = self.inner.lock();
            st.shutting_down = true;
            st.waiting.clear();
            st.heap.clear();
        }
        debug!(queue = %self.inner.name, "queue shutting down");
        self.inner.ready.notify_waiters();
        self.inner.delay_wake.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }
}

async fn run_delays(inner: Arc<Inner>) {
    loop {
        let (next, woken) = {
            let mut st = inner.lock();
            if st.shutting_down {
                return;
            }
            let now = Instant::now();
            let mut woken = 0usize;
            while st.heap.peek().map_or(false, |Reverse((at, _, _))| *at <= now) {
                let Some(Reverse((at, _, key))) = st.heap.pop() else { break };
                if st.waiting.get(&key) != Some(&at) {
                    continue;
                }
                st.waiting.remove(&key);
                if inner.add_locked(&mut st, key) {
                    woken += 1;
                }
            }
            (st.heap.peek().map(|Reverse((at, _, _))| *at), woken)
        };
        for _ in 0..woken {
            inner.ready.notify_one();
        }
        match next {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = inner.delay_wake.notified() => {}
                }
            }
            None => inner.delay_wake.notified().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> RateLimitingQueue {
        RateLimitingQueue::new(
            "test",
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_millis(50)),
        )
    }

    #[tokio::test]
    async fn duplicate_adds_keep_first_position() {
        let q = queue();
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        q.shut_down();
    }

    #[tokio::test]
    async fn adds_while_processing_are_deferred_until_done() {
        let q = queue();
        q.add("k");
        let k = q.get().await.unwrap();
        q.add("k");
        q.add("k");
        assert_eq!(q.len(), 0, "processing key must not be handed out twice");
        q.done(&k);
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        assert_eq!(again, "k");
        q.done(&again);
        assert!(q.is_empty());
        q.shut_down();
    }

    #[tokio::test]
    async fn shut_down_releases_waiters() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        q.add("late");
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_keeps_earliest_deadline() {
        let q = queue();
        q.add_after("k", Duration::from_secs(10));
        q.add_after("k", Duration::from_secs(1));
        q.add_after("k", Duration::from_secs(5));
        assert_eq!(q.delayed_len(), 1);

        let start = Instant::now();
        assert_eq!(q.get().await.as_deref(), Some("k"));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(5), "{:?}", waited);
        q.done("k");
        assert!(q.is_empty());
        q.shut_down();
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_and_forget_resets() {
        let q = queue();
        for expected_ms in [1u64, 2, 4] {
            let start = Instant::now();
            q.add_rate_limited("k");
            let k = q.get().await.unwrap();
            assert!(start.elapsed() >= Duration::from_millis(expected_ms));
            q.done(&k);
        }
        assert_eq!(q.num_requeues("k"), 3);
        q.forget("k");
        assert_eq!(q.num_requeues("k"), 0);
        q.shut_down();
    }
}
