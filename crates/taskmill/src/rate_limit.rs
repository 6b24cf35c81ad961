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

//! # Rate Limiter
//!
//! Two budgets gate the task queue:
//!
//! - a daily token budget, keyed by the UTC calendar day, and
//! - a per-minute request budget, keyed by the wall-clock minute.
//!
//! Counters persist through the store so a restart keeps the day's usage.
//! Windows roll over by comparing the stored window key with the current
//! time, so reading the status any number of times inside a window never
//! resets anything.

use chrono::{DateTime, DurationRound, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::error::StoreError;
use crate::models::{RateStatus, RateUsage};
use crate::store::Store;

/// Token and request budget gate.
#[derive(Debug)]
pub struct RateLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    // Serializes read-modify-write cycles on the persisted counters.
    write_lock: Mutex<()>,
}

fn minute_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(at)
}

fn next_midnight(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or(at)
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self {
            store,
            clock,
            config,
            write_lock: Mutex::new(()),
        }
    }

    /// Stored counters with any elapsed window reset.
    async fn current_usage(&self, now: DateTime<Utc>) -> Result<RateUsage, StoreError> {
        let today = now.date_naive();
        let minute = minute_start(now);

        let mut usage = self.store.load_rate_usage().await?.unwrap_or(RateUsage {
            day: today,
            tokens_used: 0,
            minute_window_start: minute,
            requests_in_minute: 0,
        });

        if usage.day != today {
            debug!("Rate window rolled over: day {} -> {}", usage.day, today);
            usage.day = today;
            usage.tokens_used = 0;
        }
        if usage.minute_window_start != minute {
            usage.minute_window_start = minute;
            usage.requests_in_minute = 0;
        }
        Ok(usage)
    }

    fn status_of(&self, usage: &RateUsage) -> RateStatus {
        RateStatus {
            daily_used: usage.tokens_used,
            daily_limit: self.config.daily_token_limit,
            minute_used: usage.requests_in_minute,
            minute_limit: self.config.minute_request_limit,
        }
    }

    /// Usage against both budgets for the current windows.
    pub async fn get_status(&self) -> Result<RateStatus, StoreError> {
        let usage = self.current_usage(self.clock.now()).await?;
        Ok(self.status_of(&usage))
    }

    /// Whether both budgets have room for another request.
    pub async fn can_proceed(&self) -> Result<bool, StoreError> {
        let status = self.get_status().await?;
        let allowed = !status.daily_exhausted() && !status.minute_exhausted();
        if !allowed {
            warn!(
                "Rate limit reached: tokens {}/{} today, requests {}/{} this minute",
                status.daily_used, status.daily_limit, status.minute_used, status.minute_limit
            );
        }
        Ok(allowed)
    }

    /// Adds `tokens` to today's token counter.
    pub async fn record_usage(&self, tokens: u64) -> Result<RateStatus, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut usage = self.current_usage(self.clock.now()).await?;
        usage.tokens_used = usage.tokens_used.saturating_add(tokens);
        self.store.save_rate_usage(&usage).await?;
        debug!(
            "Recorded {} token(s); {} used today",
            tokens, usage.tokens_used
        );
        Ok(self.status_of(&usage))
    }

    /// Counts one dispatched request against the current minute.
    pub async fn record_request(&self) -> Result<RateStatus, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut usage = self.current_usage(self.clock.now()).await?;
        usage.requests_in_minute = usage.requests_in_minute.saturating_add(1);
        self.store.save_rate_usage(&usage).await?;
        Ok(self.status_of(&usage))
    }

    /// Wait until the exhausted window rolls over.
    ///
    /// # Returns
    ///
    /// `None` when neither budget is exhausted. When both are, the daily
    /// window decides.
    pub async fn time_until_reset(&self) -> Result<Option<Duration>, StoreError> {
        let now = self.clock.now();
        let usage = self.current_usage(now).await?;
        let status = self.status_of(&usage);

        let reset_at = if status.daily_exhausted() {
            next_midnight(now)
        } else if status.minute_exhausted() {
            usage.minute_window_start + chrono::Duration::minutes(1)
        } else {
            return Ok(None);
        };

        Ok(Some((reset_at - now).to_std().unwrap_or(Duration::ZERO)))
    }
}
