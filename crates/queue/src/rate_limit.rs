//! Rate limiters deciding how long a failing key waits before it is retried.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub trait RateLimiter: Send + Sync {
    /// Delay before `key` may be processed again; records one more failure.
    fn when(&self, key: &str) -> Duration;
    /// Stop tracking `key`: its failure count drops back to zero.
    fn forget(&self, key: &str);
    /// Number of failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &str) -> u32;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<String, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }

    fn backoff(&self, exp: u32) -> Duration {
        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, key: &str) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.to_string()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        self.backoff(exp)
    }

    fn forget(&self, key: &str) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &str) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every key: `qps` refill rate, `burst` capacity.
/// Does not track individual keys.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps, burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &str) -> Duration {
        if !self.qps.is_finite() || self.qps <= 0.0 {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let mut b = lock(&self.bucket);
        let refill = now.saturating_duration_since(b.last).as_secs_f64() * self.qps;
        b.tokens = (b.tokens + refill).min(self.burst);
        b.last = now;
        // Reservations may drive the bucket negative; the debt is paid off by waiting.
        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-b.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &str) {}

    fn num_requeues(&self, _key: &str) -> u32 {
        0
    }
}

/// Combines limiters: the longest delay and the highest failure count win.
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &str) -> Duration {
        self.limiters.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &str) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Tunables for [`default_controller_rate_limiter`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
    pub qps: f64,
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { base_delay_ms: 5, max_delay_secs: 1000, qps: 10.0, burst: 100 }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

impl RateLimiterConfig {
    /// Apply `RECON_BACKOFF_BASE_MS`, `RECON_BACKOFF_MAX_SECS`, `RECON_QPS` and `RECON_BURST`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse("RECON_BACKOFF_BASE_MS") {
            self.base_delay_ms = v;
        }
        if let Some(v) = env_parse("RECON_BACKOFF_MAX_SECS") {
            self.max_delay_secs = v;
        }
        if let Some(v) = env_parse("RECON_QPS") {
            self.qps = v;
        }
        if let Some(v) = env_parse("RECON_BURST") {
            self.burst = v;
        }
        self
    }

    pub fn build(&self) -> MaxOfRateLimiter {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_secs(self.max_delay_secs),
            )),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

/// Per-key exponential backoff (5ms .. 1000s) combined with a 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter() -> MaxOfRateLimiter {
    RateLimiterConfig::default().build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let rl = ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_millis(60));
        let delays: Vec<_> = (0..6).map(|_| rl.when("a")).collect();
        assert_eq!(
            delays,
            [5, 10, 20, 40, 60, 60].map(Duration::from_millis).to_vec()
        );
        assert_eq!(rl.num_requeues("a"), 6);
        assert_eq!(rl.num_requeues("b"), 0);

        rl.forget("a");
        assert_eq!(rl.num_requeues("a"), 0);
        assert_eq!(rl.when("a"), Duration::from_millis(5));
    }

    #[test]
    fn exponent_overflow_saturates_at_max() {
        let rl = ItemExponentialFailureRateLimiter::new(Duration::from_secs(1), Duration::from_secs(1000));
        assert_eq!(rl.backoff(40), Duration::from_secs(1000));
        assert_eq!(rl.backoff(u32::MAX), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_spaces_requests() {
        let rl = BucketRateLimiter::new(10.0, 2);
        assert_eq!(rl.when("x"), Duration::ZERO);
        assert_eq!(rl.when("y"), Duration::ZERO);
        let third = rl.when("z");
        assert!(third > Duration::from_millis(90) && third <= Duration::from_millis(100), "{:?}", third);
        let fourth = rl.when("z");
        assert!(fourth > third);
        assert_eq!(rl.num_requeues("z"), 0);
    }

    #[test]
    fn max_of_takes_largest_delay_and_count() {
        let rl = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1))),
            Box::new(ItemExponentialFailureRateLimiter::new(Duration::from_millis(3), Duration::from_secs(1))),
        ]);
        assert_eq!(rl.when("k"), Duration::from_millis(3));
        assert_eq!(rl.when("k"), Duration::from_millis(6));
        assert_eq!(rl.num_requeues("k"), 2);
        rl.forget("k");
        assert_eq!(rl.num_requeues("k"), 0);
    }
}
