/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! # Retry Policies
//!
//! A single retry policy type shared by the task queue (re-running a failed
//! agent command while the task stays RUNNING) and the workflow engine
//! (re-running a failed step).
//!
//! ```rust
//! use std::time::Duration;
//! use taskmill::retry::{BackoffStrategy, RetryPolicy};
//!
//! // One initial attempt plus two retries, one second apart.
//! let policy = RetryPolicy::fixed(2, Duration::from_secs(1));
//! assert_eq!(policy.max_attempts, 3);
//! assert!(policy.should_retry(2));
//! assert!(!policy.should_retry(3));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay between attempts grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always wait `initial_delay`.
    Fixed,
    /// Wait `initial_delay * attempt * multiplier`.
    Linear { multiplier: f64 },
    /// Wait `initial_delay * multiplier * base^(attempt - 1)`.
    Exponential { base: f64, multiplier: f64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Fixed
    }
}

/// Retry policy for a unit of work.
///
/// `max_attempts` counts the first attempt, so a policy with
/// `max_attempts == 1` never retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default, with = "crate::config::duration_str")]
    pub initial_delay: Duration,
    #[serde(
        default = "RetryPolicy::default_max_delay",
        with = "crate::config::duration_str"
    )]
    pub max_delay: Duration,
}

impl RetryPolicy {
    fn default_max_delay() -> Duration {
        Duration::from_secs(300)
    }

    /// A policy that runs the work exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffStrategy::Fixed,
            initial_delay: Duration::ZERO,
            max_delay: Self::default_max_delay(),
        }
    }

    /// `max_retries` additional attempts, `retry_delay` apart.
    pub fn fixed(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            backoff: BackoffStrategy::Fixed,
            initial_delay: retry_delay,
            max_delay: Self::default_max_delay().max(retry_delay),
        }
    }

    /// Exponential backoff doubling from `initial_delay`.
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: BackoffStrategy::Exponential {
                base: 2.0,
                multiplier: 1.0,
            },
            initial_delay,
            max_delay: Self::default_max_delay(),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Number of retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after `attempt` (1-based) failed, capped at `max_delay`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_secs = self.initial_delay.as_secs_f64();
        let secs = match &self.backoff {
            BackoffStrategy::Fixed => base_secs,
            BackoffStrategy::Linear { multiplier } => base_secs * f64::from(attempt) * multiplier,
            BackoffStrategy::Exponential { base, multiplier } => {
                base_secs * multiplier * base.powf(f64::from(attempt - 1))
            }
        };

        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        if secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
