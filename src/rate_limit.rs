//! Token-bucket rate limiting.
//!
//! The bucket refills continuously at `rate` tokens per second up to
//! `capacity`. Refill and deduction happen inside one critical section, so two
//! callers never observe the same tokens as available.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::telemetry;

/// What [`RateLimiter::acquire`] does when not enough tokens are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdmissionPolicy {
    /// Wait until enough tokens accrue
    #[default]
    Block,
    /// Fail immediately with [`Error::RateLimited`]
    Reject,
}

/// Configuration for a [`RateLimiter`]
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimiterConfig {
    /// Maximum tokens the bucket holds (burst size)
    pub capacity: f64,
    /// Tokens added per second
    pub rate_per_second: f64,
    /// Behaviour of `acquire` when the bucket runs dry
    pub policy: AdmissionPolicy,
}

impl RateLimiterConfig {
    pub fn new(capacity: f64, rate_per_second: f64) -> Self {
        Self {
            capacity,
            rate_per_second,
            policy: AdmissionPolicy::Block,
        }
    }

    /// Set the admission policy
    pub fn policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            return Err(Error::config(format!(
                "rate limiter capacity must be positive, got {}",
                self.capacity
            )));
        }
        if !(self.rate_per_second.is_finite() && self.rate_per_second > 0.0) {
            return Err(Error::config(format!(
                "rate limiter rate must be positive, got {}",
                self.rate_per_second
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token-bucket rate limiter. Starts full.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    rate: f64,
    policy: AdmissionPolicy,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a blocking limiter. Both values must be finite and positive.
    pub fn new(capacity: f64, rate_per_second: f64) -> Result<Self> {
        Self::from_config(&RateLimiterConfig::new(capacity, rate_per_second))
    }

    pub fn from_config(config: &RateLimiterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            capacity: config.capacity,
            rate: config.rate_per_second,
            policy: config.policy,
            bucket: Mutex::new(Bucket {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Take `n` tokens if they are available right now. A request that is
    /// negative or not finite is never admitted.
    pub fn allow(&self, n: f64) -> bool {
        if !valid_request(n) {
            tracing::debug!(requested = n, "invalid token request refused");
            return false;
        }
        let mut bucket = self.refilled();
        if bucket.tokens >= n {
            bucket.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Wait until `n` tokens are available and take them.
    ///
    /// Fails with [`Error::Config`] if `n` exceeds the capacity, since such a
    /// request can never be satisfied, and with [`Error::Cancelled`] if
    /// `token` fires first.
    pub async fn wait(&self, n: f64, token: &CancelToken) -> Result<()> {
        if !valid_request(n) {
            return Err(Error::config(format!(
                "token request must be finite and non-negative, got {}",
                n
            )));
        }
        if n > self.capacity {
            return Err(Error::config(format!(
                "requested {} tokens from a bucket of capacity {}",
                n, self.capacity
            )));
        }
        loop {
            if token.is_cancelled() {
                return Err(token.cancelled_error());
            }
            let deficit = {
                let mut bucket = self.refilled();
                if bucket.tokens >= n {
                    bucket.tokens -= n;
                    return Ok(());
                }
                n - bucket.tokens
            };
            let Ok(delay) = Duration::try_from_secs_f64(deficit / self.rate) else {
                // Refill is too slow to ever express as a delay.
                tracing::debug!(requested = n, rate = self.rate, "rate limiter waiting on token only");
                token.cancelled().await;
                continue;
            };
            tracing::trace!(requested = n, ?delay, "rate limiter waiting for tokens");
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Take `n` tokens according to the configured [`AdmissionPolicy`].
    pub async fn acquire(&self, n: f64, token: &CancelToken) -> Result<()> {
        if !valid_request(n) {
            return Err(Error::config(format!(
                "token request must be finite and non-negative, got {}",
                n
            )));
        }
        match self.policy {
            AdmissionPolicy::Block => self.wait(n, token).await,
            AdmissionPolicy::Reject => {
                if self.allow(n) {
                    Ok(())
                } else {
                    telemetry::rate_limit_rejected();
                    Err(Error::RateLimited { requested: n })
                }
            }
        }
    }

    /// Tokens available right now, after refilling.
    pub fn available(&self) -> f64 {
        self.refilled().tokens
    }

    fn refilled(&self) -> MutexGuard<'_, Bucket> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;
        bucket
    }
}

fn valid_request(n: f64) -> bool {
    n.is_finite() && n >= 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_positive_configuration() {
        assert!(matches!(RateLimiter::new(0.0, 1.0), Err(Error::Config(_))));
        assert!(matches!(RateLimiter::new(5.0, -1.0), Err(Error::Config(_))));
        assert!(matches!(RateLimiter::new(f64::NAN, 1.0), Err(Error::Config(_))));
        assert!(RateLimiter::new(1.0, 0.5).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_drains_and_refills() {
        let limiter = RateLimiter::new(5.0, 10.0).unwrap();
        assert!(limiter.allow(5.0));
        assert!(!limiter.allow(1.0));

        // 0.25s at 10 tokens/s accrues 2.5 tokens.
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(!limiter.allow(3.0));
        assert!(limiter.allow(2.5));
        assert!(!limiter.allow(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_matches_accrual_bound() {
        // n succeeds iff n <= min(K, n0 + R*t)
        for (n, wait_ms, expect) in [
            (3.0, 100, true),
            (3.1, 100, false),
            (4.0, 10_000, true),
            (4.5, 10_000, false),
        ] {
            let limiter = RateLimiter::new(4.0, 20.0).unwrap();
            assert!(limiter.allow(3.0)); // n0 = 1
            tokio::time::advance(Duration::from_millis(wait_ms)).await;
            assert_eq!(limiter.allow(n), expect, "n={} t={}ms", n, wait_ms);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_exceed_capacity() {
        let limiter = RateLimiter::new(3.0, 100.0).unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available(), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_for_deficit() {
        let limiter = RateLimiter::new(2.0, 4.0).unwrap();
        let token = CancelToken::new();
        assert!(limiter.allow(2.0));

        let start = Instant::now();
        limiter.wait(1.0, &token).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(260), "{:?}", elapsed);
        assert!(limiter.available() < 0.1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_observes_cancellation() {
        let limiter = RateLimiter::new(1.0, 0.001).unwrap();
        let token = CancelToken::with_timeout(Duration::from_millis(50));
        assert!(limiter.allow(1.0));

        let err = limiter.wait(1.0, &token).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_with_negligible_rate_waits_for_token() {
        let limiter = RateLimiter::new(1.0, 1e-300).unwrap();
        let token = CancelToken::with_timeout(Duration::from_millis(50));
        assert!(limiter.allow(1.0));

        let err = limiter.wait(1.0, &token).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_invalid_requests_are_refused() {
        let limiter = RateLimiter::new(2.0, 1.0).unwrap();
        let token = CancelToken::new();

        assert!(limiter.allow(2.0));
        assert!(!limiter.allow(-5.0));
        assert!(!limiter.allow(f64::NAN));
        // A refused negative request mints nothing.
        assert!(limiter.available() < 0.1);
        assert!(matches!(
            limiter.wait(f64::NAN, &token).await,
            Err(Error::Config(_))
        ));
        assert!(matches!(
            limiter.acquire(-1.0, &token).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_rejects_unsatisfiable_request() {
        let limiter = RateLimiter::new(2.0, 1.0).unwrap();
        let err = limiter.wait(3.0, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_reject_policy() {
        let config = RateLimiterConfig::new(1.0, 1.0).policy(AdmissionPolicy::Reject);
        let limiter = RateLimiter::from_config(&config).unwrap();
        let token = CancelToken::new();

        limiter.acquire(1.0, &token).await.unwrap();
        assert!(matches!(
            limiter.acquire(1.0, &token).await,
            Err(Error::RateLimited { .. })
        ));
    }
}
