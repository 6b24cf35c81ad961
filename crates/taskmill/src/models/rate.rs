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

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Persisted rate counters for the current day and minute windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateUsage {
    pub day: NaiveDate,
    pub tokens_used: u64,
    pub minute_window_start: DateTime<Utc>,
    pub requests_in_minute: u32,
}

/// Snapshot of rate usage against the configured budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateStatus {
    pub daily_used: u64,
    pub daily_limit: u64,
    pub minute_used: u32,
    pub minute_limit: u32,
}

impl RateStatus {
    /// Share of the daily token budget consumed, clamped to `0.0..=100.0`.
    pub fn daily_percentage(&self) -> f64 {
        percentage(self.daily_used as f64, self.daily_limit as f64)
    }

    /// Share of the minute request budget consumed, clamped to `0.0..=100.0`.
    pub fn minute_percentage(&self) -> f64 {
        percentage(self.minute_used as f64, self.minute_limit as f64)
    }

    pub fn daily_exhausted(&self) -> bool {
        self.daily_used >= self.daily_limit
    }

    pub fn minute_exhausted(&self) -> bool {
        self.minute_used >= self.minute_limit
    }
}

fn percentage(used: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 100.0;
    }
    (used / limit * 100.0).clamp(0.0, 100.0)
}
