//! Quota-aware rate limiter for Gmail API calls
//!
//! Gmail meters each user in "quota units" per second (250 by default).
//! Costs used here:
//! - `messages.list`, `messages.get`: 5 units
//! - `messages.batchModify`: 50 units
//! - `getProfile`: 1 unit
//!
//! A token bucket refills at the configured rate and allows short bursts.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::RateLimitConfig;

/// Quota cost of the calls this tool makes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCost {
    List,
    Get,
    BatchModify,
    Profile,
}

impl QuotaCost {
    pub fn units(&self) -> u32 {
        match self {
            QuotaCost::List | QuotaCost::Get => 5,
            QuotaCost::BatchModify => 50,
            QuotaCost::Profile => 1,
        }
    }
}

/// Token bucket shared by every clone
#[derive(Debug, Clone)]
pub struct QuotaRateLimiter {
    inner: Arc<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    available: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    consumed: u64,
    calls: u64,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

impl QuotaRateLimiter {
    /// Limiter starting with a full bucket
    pub fn new(units_per_second: f64, burst_units: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Bucket {
                available: burst_units,
                capacity: burst_units,
                refill_per_sec: units_per_second,
                last_refill: Instant::now(),
                consumed: 0,
                calls: 0,
            })),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.units_per_second, config.burst_units)
    }

    /// Take `cost` units, sleeping until the bucket holds enough
    pub async fn acquire(&self, cost: QuotaCost) {
        let needed = cost.units() as f64;

        loop {
            let wait = {
                let mut bucket = self.inner.lock().await;
                bucket.refill();

                trace!(
                    "Quota: {:.1}/{:.1} units available, need {:.0}",
                    bucket.available,
                    bucket.capacity,
                    needed
                );

                if bucket.available >= needed {
                    bucket.available -= needed;
                    bucket.consumed += needed as u64;
                    bucket.calls += 1;
                    return;
                }

                Duration::from_secs_f64((needed - bucket.available) / bucket.refill_per_sec)
            };

            // Sleep without holding the lock so other callers can refill-check
            debug!("Quota exhausted, waiting {:.2}s for {:?}", wait.as_secs_f64(), cost);
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn stats(&self) -> QuotaStats {
        let mut bucket = self.inner.lock().await;
        bucket.refill();
        QuotaStats {
            available_units: bucket.available as u32,
            total_consumed: bucket.consumed,
            total_calls: bucket.calls,
        }
    }
}

impl Default for QuotaRateLimiter {
    fn default() -> Self {
        Self::new(250.0, 500.0)
    }
}

/// Snapshot of quota usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaStats {
    pub available_units: u32,
    pub total_consumed: u64,
    pub total_calls: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_cost_units() {
        assert_eq!(QuotaCost::List.units(), 5);
        assert_eq!(QuotaCost::Get.units(), 5);
        assert_eq!(QuotaCost::BatchModify.units(), 50);
        assert_eq!(QuotaCost::Profile.units(), 1);
    }

    #[tokio::test]
    async fn test_acquire_from_full_bucket_is_immediate() {
        let limiter = QuotaRateLimiter::new(100.0, 100.0);
        let start = Instant::now();
        limiter.acquire(QuotaCost::BatchModify).await;
        assert!(start.elapsed() < Duration::from_millis(20));

        let stats = limiter.stats().await;
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.total_consumed, 50);
    }

    #[tokio::test]
    async fn test_acquire_waits_when_exhausted() {
        let limiter = QuotaRateLimiter::new(100.0, 10.0);
        limiter.acquire(QuotaCost::Get).await;
        limiter.acquire(QuotaCost::Get).await;

        // Empty now: 5 units at 100/s is about 50ms
        let start = Instant::now();
        limiter.acquire(QuotaCost::Get).await;
        assert!(start.elapsed().as_millis() >= 40);
    }

    #[tokio::test]
    async fn test_clones_share_one_bucket() {
        let a = QuotaRateLimiter::new(100.0, 100.0);
        let b = a.clone();
        a.acquire(QuotaCost::List).await;
        assert_eq!(b.stats().await.total_calls, 1);
    }
}
