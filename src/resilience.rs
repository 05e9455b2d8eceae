// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delivery retry policy and import rate limiting.
//!
//! - [`RetryConfig`]: exponential backoff between delivery attempts
//! - [`RateLimiter`]: token bucket shared by an agent's delivery workers
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use distribution_engine::resilience::{RateLimiter, RateLimitConfig, RetryConfig};
//!
//! let retry = RetryConfig::default();
//! tokio::time::sleep(retry.delay_for_attempt(1)).await;
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // waits if the agent is importing too fast
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// How long a delivery worker backs off after a failed attempt.
///
/// The attempt budget lives on the queue, which decides when an item moves
/// to ERROR.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Delay before the next attempt after `attempt` failures (1-indexed).
    ///
    /// ```text
    /// Failures  Delay (defaults)
    /// --------  ----------------
    /// 1         500ms
    /// 2         1s
    /// 3         2s
    /// 4         4s
    /// ...       capped at 5m
    /// ```
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        // Clamp the exponent so powi stays finite for long-lived items.
        let exponent = (attempt - 1).min(64) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket settings.
///
/// Tokens refill at `refill_rate` per second, up to `burst_size` tokens. Each
/// import consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 imports/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter for import calls.
///
/// One limiter is shared by all delivery workers of an agent so fan-out over
/// many endpoints cannot flood the network after a backlog builds up.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait for a permit. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}
