//! Requeue pacing: exponential per-item backoff combined with a token
//! bucket over all requeues. A requeued item waits for the longer of the two.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use resource::ResourceRef;
use serde::{Deserialize, Serialize};

/// Per-item exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first requeue; doubled for every further failure.
    #[serde(with = "resource::serde_millis")]
    pub base_delay: Duration,
    #[serde(with = "resource::serde_millis")]
    pub max_delay: Duration,
    /// Add 0-50% random jitter on top of the computed delay.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl BackoffConfig {
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before requeue number `failures` (zero-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let exponential = base.saturating_mul(2_u64.saturating_pow(failures));
        let delay = exponential.min(self.max_delay.as_millis() as u64);

        if self.jitter {
            let jitter = fastrand::u64(0..=delay / 2);
            Duration::from_millis(delay + jitter)
        } else {
            Duration::from_millis(delay)
        }
    }
}

/// Failure counts per resource, cleared with [`forget`](Self::forget) once
/// the resource reaches a terminal outcome.
#[derive(Debug, Default)]
pub struct ItemRateLimiter {
    config: BackoffConfig,
    failures: DashMap<ResourceRef, u32>,
}

impl ItemRateLimiter {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: DashMap::new(),
        }
    }

    /// Backoff for the next requeue of `item`; records the failure.
    pub fn when(&self, item: &ResourceRef) -> Duration {
        let mut failures = self.failures.entry(item.clone()).or_insert(0);
        let delay = self.config.delay_for(*failures);
        *failures += 1;
        delay
    }

    pub fn forget(&self, item: &ResourceRef) {
        self.failures.remove(item);
    }

    pub fn num_requeues(&self, item: &ResourceRef) -> u32 {
        self.failures.get(item).map(|count| *count).unwrap_or(0)
    }

    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}

/// Overall requeue rate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained requeues per second; zero or less disables the bucket.
    pub requests_per_second: f64,
    /// Requeues allowed back to back before the rate applies.
    pub burst_size: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst_size: 100,
        }
    }
}

impl RateLimitConfig {
    pub fn with_requests_per_second(mut self, rps: f64) -> Self {
        self.requests_per_second = rps;
        self
    }

    pub fn with_burst_size(mut self, burst: u64) -> Self {
        self.burst_size = burst;
        self
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

/// Token bucket that hands out reservations instead of blocking, so the
/// queue can park a requeued item until its token is due.
#[derive(Debug)]
pub struct TokenBucket {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
    total_requests: AtomicU64,
    total_delayed: AtomicU64,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.burst_size as f64,
                last_update: Instant::now(),
            }),
            total_requests: AtomicU64::new(0),
            total_delayed: AtomicU64::new(0),
        }
    }

    fn enabled(&self) -> bool {
        self.config.requests_per_second > 0.0
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.last_update = now;
        state.tokens =
            (state.tokens + elapsed * self.config.requests_per_second).min(self.config.burst_size as f64);
    }

    /// Take a token without waiting.
    pub fn try_acquire(&self) -> bool {
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        if !self.enabled() {
            return true;
        }
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take a token now, possibly borrowing against the future. Returns how
    /// long the caller must wait before the token is really available.
    pub fn reserve(&self) -> Duration {
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        if !self.enabled() {
            return Duration::ZERO;
        }
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill(&mut state);
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            return Duration::ZERO;
        }
        self.total_delayed.fetch_add(1, Ordering::SeqCst);
        Duration::from_secs_f64(-state.tokens / self.config.requests_per_second)
    }

    pub fn stats(&self) -> RateLimitStats {
        let available_tokens = self.state.lock().unwrap_or_else(|p| p.into_inner()).tokens;
        RateLimitStats {
            available_tokens,
            total_requests: self.total_requests.load(Ordering::SeqCst),
            total_delayed: self.total_delayed.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitStats {
    /// Negative while reservations are outstanding.
    pub available_tokens: f64,
    pub total_requests: u64,
    pub total_delayed: u64,
}

impl RateLimitStats {
    pub fn delay_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_delayed as f64 / self.total_requests as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn widget(name: &str) -> ResourceRef {
        ResourceRef::new("Widget", "default", name)
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let config = BackoffConfig::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(400));
        assert_eq!(config.delay_for(3), Duration::from_millis(500));
        assert_eq!(config.delay_for(63), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_half_the_delay() {
        let config = BackoffConfig::default()
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(true);
        for _ in 0..50 {
            let delay = config.delay_for(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn limiter_tracks_items_independently() {
        let limiter = ItemRateLimiter::new(
            BackoffConfig::default().with_base_delay(Duration::from_millis(10)),
        );
        assert_eq!(limiter.when(&widget("a")), Duration::from_millis(10));
        assert_eq!(limiter.when(&widget("a")), Duration::from_millis(20));
        assert_eq!(limiter.when(&widget("b")), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues(&widget("a")), 2);

        limiter.forget(&widget("a"));
        assert_eq!(limiter.num_requeues(&widget("a")), 0);
        assert_eq!(limiter.when(&widget("a")), Duration::from_millis(10));
        assert_eq!(limiter.tracked(), 2);
    }

    #[test]
    fn bucket_serves_burst_then_delays() {
        let bucket = TokenBucket::new(
            RateLimitConfig::default()
                .with_requests_per_second(10.0)
                .with_burst_size(2),
        );
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        let wait = bucket.reserve();
        assert!(wait > Duration::from_millis(50) && wait <= Duration::from_millis(100));

        let stats = bucket.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_delayed, 1);
        assert!(stats.available_tokens < 0.0);
    }

    #[test]
    fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(
            RateLimitConfig::default()
                .with_requests_per_second(100.0)
                .with_burst_size(1),
        );
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        thread::sleep(Duration::from_millis(20));
        assert!(bucket.try_acquire());
    }

    #[test]
    fn zero_rate_disables_the_bucket() {
        let bucket = TokenBucket::new(RateLimitConfig::default().with_requests_per_second(0.0).with_burst_size(0));
        for _ in 0..5 {
            assert_eq!(bucket.reserve(), Duration::ZERO);
        }
    }
}
