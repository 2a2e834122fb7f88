//! Rate limiting for verification attempts and challenge issuance.
//!
//! Two distinct gates share the [`CounterStore`] seam:
//!
//! - [`AttemptLimiter`]: a fixed-window cap on failed verification attempts,
//!   keyed by (driver, user, source IP). Alongside the counter it stores the
//!   window's absolute expiry, so "seconds remaining" in the error is exact
//!   even after part of the window has elapsed.
//! - [`Throttle`]: a minimum-interval gate on repeated challenge issuance
//!   (email OTP resend), keyed per user.
//!
//! # Tracing Events
//!
//! - `mfa.rate_limited` - verification blocked by the attempt limiter
//! - `mfa.throttled` - challenge issuance blocked by the send throttle

use crate::config::RateLimitConfig;
use crate::counter::CounterStore;
use crate::error::{MfaError, Result};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Fixed-window limiter for failed verification attempts.
#[derive(Clone)]
pub struct AttemptLimiter {
    counters: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl AttemptLimiter {
    /// Create a limiter over the given counter store.
    #[must_use]
    pub fn new(counters: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { counters, config }
    }

    fn expiry_key(key: &str) -> String {
        format!("{key}:expires")
    }

    /// Fail with `RateLimitExceeded` when the key has reached the attempt cap.
    pub async fn check(&self, key: &str) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let attempts = self.counters.get(key).await?.unwrap_or(0);
        if attempts < i64::from(self.config.max_attempts) {
            return Ok(());
        }

        let seconds_remaining = match self.counters.get(&Self::expiry_key(key)).await? {
            Some(expires_at) => (expires_at - unix_now()).max(0) as u64,
            None => self.config.decay_window.as_secs(),
        };
        tracing::warn!(
            target: "mfa.rate_limited",
            key = %key,
            attempts = attempts,
            seconds_remaining = seconds_remaining,
            "Verification attempt rate limited"
        );
        Err(MfaError::RateLimitExceeded { seconds_remaining })
    }

    /// Record a failed attempt: bump the counter and refresh the window's
    /// absolute expiry, both with the decay TTL.
    pub async fn record_failure(&self, key: &str) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let ttl = self.config.decay_window;
        self.counters.increment(key, Some(ttl)).await?;
        self.counters
            .put(
                &Self::expiry_key(key),
                unix_now() + ttl.as_secs() as i64,
                Some(ttl),
            )
            .await?;
        Ok(())
    }

    /// Reset the window after a successful verification.
    pub async fn clear(&self, key: &str) -> Result<()> {
        self.counters.delete(key).await?;
        self.counters.delete(&Self::expiry_key(key)).await?;
        Ok(())
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

/// Minimum-interval gate on repeated challenge issuance.
#[derive(Clone)]
pub struct Throttle {
    counters: Arc<dyn CounterStore>,
    interval: Duration,
}

impl Throttle {
    /// Create a throttle with the given minimum interval.
    #[must_use]
    pub fn new(counters: Arc<dyn CounterStore>, interval: Duration) -> Self {
        Self { counters, interval }
    }

    /// Whether the key is currently throttled, and for how many more seconds.
    pub async fn remaining(&self, key: &str) -> Result<Option<u64>> {
        match self.counters.get(key).await? {
            Some(expires_at) => {
                let left = expires_at - unix_now();
                Ok((left > 0).then_some(left as u64))
            }
            None => Ok(None),
        }
    }

    /// Fail with `RateLimitExceeded` while the gate is closed.
    pub async fn check(&self, key: &str) -> Result<()> {
        if let Some(seconds_remaining) = self.remaining(key).await? {
            tracing::warn!(
                target: "mfa.throttled",
                key = %key,
                seconds_remaining = seconds_remaining,
                "Challenge issuance throttled"
            );
            return Err(MfaError::RateLimitExceeded { seconds_remaining });
        }
        Ok(())
    }

    /// Close the gate for the configured interval.
    pub async fn set(&self, key: &str) -> Result<()> {
        self.counters
            .put(
                key,
                unix_now() + self.interval.as_secs() as i64,
                Some(self.interval),
            )
            .await
    }
}
