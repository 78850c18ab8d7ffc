//! Submission throttling.
//!
//! Token-bucket limiters keyed per user, per device, and globally. The
//! caller only sees `allow(key) -> bool`; what happens on exhaustion is the
//! configured strategy's business.

use dashmap::DashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// What to do when a bucket is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleStrategy {
    /// Refuse immediately.
    Reject,
    /// Wait one short grace period, then re-check once.
    Delay,
    /// Wait (synchronously) until a token is available.
    Block,
}

const DELAY_GRACE: Duration = Duration::from_millis(100);

/// A single token bucket.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl Bucket {
    fn new(burst: u32) -> Self {
        let now = Instant::now();
        Self {
            tokens: burst as f64,
            last_refill: now,
            last_used: now,
        }
    }

    fn try_take(&mut self, rate: f64, burst: u32) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst as f64);
        self.last_refill = now;
        self.last_used = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one token is available.
    fn wait_hint(&self, rate: f64) -> Duration {
        if self.tokens >= 1.0 || rate <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / rate)
        }
    }
}

/// Keyed rate limiter with idle-entry cleanup.
pub struct KeyedThrottler {
    buckets: DashMap<String, Mutex<Bucket>>,
    rate: f64,
    burst: u32,
    idle_expiry: Duration,
    strategy: ThrottleStrategy,
}

impl KeyedThrottler {
    pub fn new(rate: f64, burst: u32, idle_expiry: Duration, strategy: ThrottleStrategy) -> Self {
        Self {
            buckets: DashMap::new(),
            rate,
            burst,
            idle_expiry,
            strategy,
        }
    }

    /// Checks (and consumes) one token for the key.
    pub fn allow(&self, key: &str) -> bool {
        let entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(Bucket::new(self.burst)));

        let mut bucket = entry.lock().unwrap();
        if bucket.try_take(self.rate, self.burst) {
            return true;
        }

        match self.strategy {
            ThrottleStrategy::Reject => {
                debug!(key, "throttled");
                false
            }
            ThrottleStrategy::Delay => {
                std::thread::sleep(DELAY_GRACE);
                bucket.try_take(self.rate, self.burst)
            }
            ThrottleStrategy::Block => {
                let wait = bucket.wait_hint(self.rate);
                std::thread::sleep(wait);
                bucket.try_take(self.rate, self.burst)
            }
        }
    }

    pub fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    /// Drops buckets idle past the expiry; returns how many were removed.
    pub fn cleanup_idle(&self) -> usize {
        let cutoff = Instant::now();
        let expiry = self.idle_expiry;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let bucket = bucket.lock().unwrap();
            cutoff.duration_since(bucket.last_used) < expiry
        });
        before - self.buckets.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

/// Global limiter: a keyed throttler with a single well-known key.
pub struct GlobalThrottler {
    inner: KeyedThrottler,
}

impl GlobalThrottler {
    pub fn new(rate: f64, burst: u32, strategy: ThrottleStrategy) -> Self {
        Self {
            inner: KeyedThrottler::new(rate, burst, Duration::from_secs(3600), strategy),
        }
    }

    pub fn allow(&self) -> bool {
        self.inner.allow("global")
    }

    pub fn reset(&self) {
        self.inner.reset("global");
    }
}

/// The limiter set guarding the orchestrator's submission entry.
pub struct SubmissionThrottle {
    per_user: Option<KeyedThrottler>,
    per_device: Option<KeyedThrottler>,
    global: Option<GlobalThrottler>,
}

impl SubmissionThrottle {
    pub fn new(
        per_user: Option<KeyedThrottler>,
        per_device: Option<KeyedThrottler>,
        global: Option<GlobalThrottler>,
    ) -> Self {
        Self {
            per_user,
            per_device,
            global,
        }
    }

    /// No limiting at all.
    pub fn disabled() -> Self {
        Self::new(None, None, None)
    }

    pub fn allow_user(&self, user_id: &str) -> bool {
        if let Some(global) = &self.global {
            if !global.allow() {
                return false;
            }
        }
        match &self.per_user {
            Some(throttler) => throttler.allow(user_id),
            None => true,
        }
    }

    pub fn allow_device(&self, device_id: &str) -> bool {
        match &self.per_device {
            Some(throttler) => throttler.allow(device_id),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_reject() {
        let throttler = KeyedThrottler::new(
            0.001,
            2,
            Duration::from_secs(60),
            ThrottleStrategy::Reject,
        );
        assert!(throttler.allow("u1"));
        assert!(throttler.allow("u1"));
        assert!(!throttler.allow("u1"));
        // Independent key, independent bucket.
        assert!(throttler.allow("u2"));
    }

    #[test]
    fn test_refill_restores_tokens() {
        let throttler = KeyedThrottler::new(
            50.0,
            1,
            Duration::from_secs(60),
            ThrottleStrategy::Reject,
        );
        assert!(throttler.allow("k"));
        assert!(!throttler.allow("k"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(throttler.allow("k"));
    }

    #[test]
    fn test_reset_clears_bucket() {
        let throttler =
            KeyedThrottler::new(0.001, 1, Duration::from_secs(60), ThrottleStrategy::Reject);
        assert!(throttler.allow("k"));
        assert!(!throttler.allow("k"));
        throttler.reset("k");
        assert!(throttler.allow("k"));
    }

    #[test]
    fn test_cleanup_drops_idle_buckets() {
        let throttler = KeyedThrottler::new(
            10.0,
            1,
            Duration::from_millis(10),
            ThrottleStrategy::Reject,
        );
        throttler.allow("stale");
        std::thread::sleep(Duration::from_millis(25));
        throttler.allow("fresh");

        assert_eq!(throttler.cleanup_idle(), 1);
        assert_eq!(throttler.tracked_keys(), 1);
    }

    #[test]
    fn test_block_strategy_waits_for_token() {
        let throttler =
            KeyedThrottler::new(20.0, 1, Duration::from_secs(60), ThrottleStrategy::Block);
        assert!(throttler.allow("k"));
        let start = Instant::now();
        assert!(throttler.allow("k"));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_disabled_throttle_allows_everything() {
        let throttle = SubmissionThrottle::disabled();
        for _ in 0..100 {
            assert!(throttle.allow_user("u"));
            assert!(throttle.allow_device("d"));
        }
    }

    #[test]
    fn test_global_gate_applies_before_user() {
        let throttle = SubmissionThrottle::new(
            None,
            None,
            Some(GlobalThrottler::new(0.001, 1, ThrottleStrategy::Reject)),
        );
        assert!(throttle.allow_user("a"));
        // The global bucket is drained regardless of key.
        assert!(!throttle.allow_user("b"));
    }
}
