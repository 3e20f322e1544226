//! Transport-level retry with exponential backoff.
//!
//! [`BackoffConfig`] controls how transient upstream failures (408, 429,
//! 502, 503, streaming timeouts) are retried with increasing delays. The
//! orchestrator uses [`BackoffConfig::standard()`] against the gateway;
//! tests zero the initial delay with [`BackoffConfig::immediate()`].

use std::time::Duration;

/// Configuration for transport-level retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Maximum number of transport retries after the initial attempt.
    pub max_retries: u32,

    /// Delay before the first retry. Default: 1 second.
    pub initial_delay: Duration,

    /// Multiplier applied per retry. Delay grows: initial, initial * m, ...
    pub multiplier: f64,

    /// Cap on the delay between retries. Prevents exponential blowup on
    /// sustained outages.
    pub max_delay: Duration,

    /// Jitter strategy. Default: none (deterministic doubling).
    pub jitter: JitterStrategy,
}

/// Jitter strategy to prevent thundering herd on shared rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// Delay is exactly the calculated value.
    None,
    /// Full jitter: random value in `[0, calculated_delay]`.
    Full,
}

impl BackoffConfig {
    /// Gateway defaults: 3 retries, 1 s initial, doubling, 60 s cap.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::None,
        }
    }

    /// No delay between retries. For tests.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            ..Self::standard()
        }
    }

    /// No retry at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// Calculate the delay for retry attempt N (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
        };

        Duration::from_secs_f64(jittered)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::standard()
    }
}
