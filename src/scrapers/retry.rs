//! Bounded retries with jittered backoff.
//!
//! Item attempts, challenge sub-attempts and session setup all go through
//! [`Retrier`] so they share one notion of "attempt budget" and "pause".

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::shutdown::Shutdown;

/// Uniform random delay between two bounds, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayRange {
    pub const ZERO: DelayRange = DelayRange {
        min_secs: 0.0,
        max_secs: 0.0,
    };

    pub const fn secs(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    /// Draw one delay from the range.
    pub fn sample(&self) -> Duration {
        let min = self.min_secs.max(0.0);
        let max = self.max_secs.max(0.0);
        let secs = if max > min {
            rand::rng().random_range(min..max)
        } else {
            min
        };
        Duration::from_secs_f64(secs)
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            min_secs: self.min_secs * factor,
            max_secs: self.max_secs * factor,
        }
    }
}

/// How many times to try something and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: DelayRange,
    /// Multiplier applied to `backoff` for each further retry.
    #[serde(default = "default_growth")]
    pub growth: f64,
}

fn default_growth() -> f64 {
    1.0
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: DelayRange) -> Self {
        Self {
            max_attempts,
            backoff,
            growth: 1.0,
        }
    }

    pub const fn with_growth(mut self, growth: f64) -> Self {
        self.growth = growth;
        self
    }

    /// Single attempt, no waiting.
    pub const fn once() -> Self {
        Self::new(1, DelayRange::ZERO)
    }

    /// The same policy with a budget of at least one attempt.
    pub const fn at_least_once(mut self) -> Self {
        if self.max_attempts == 0 {
            self.max_attempts = 1;
        }
        self
    }

    pub fn start(&self) -> Retrier {
        Retrier {
            policy: *self,
            attempt: 0,
        }
    }

    /// Backoff before attempt number `attempt` (1-based). The first attempt
    /// never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.growth.max(1.0).powi(attempt as i32 - 2);
        self.backoff.scaled(factor).sample()
    }
}

/// Running state of one retry loop.
///
/// ```ignore
/// let mut retrier = policy.start();
/// while let Some(attempt) = retrier.next_attempt(&shutdown).await {
///     match try_it().await {
///         Ok(v) => return Ok(v),
///         Err(e) => warn!("attempt {} failed: {}", attempt, e),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Retrier {
    policy: RetryPolicy,
    attempt: u32,
}

impl Retrier {
    /// Wait out the backoff (if any) and return the next attempt number.
    ///
    /// Returns `None` once the budget is spent or the shutdown signal fires.
    pub async fn next_attempt(&mut self, shutdown: &Shutdown) -> Option<u32> {
        if self.attempt >= self.policy.max_attempts || shutdown.is_triggered() {
            return None;
        }
        let next = self.attempt + 1;
        if !shutdown.sleep(self.policy.delay_before(next)).await {
            return None;
        }
        self.attempt = next;
        Some(next)
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
