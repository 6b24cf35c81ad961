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

//! Bulk create/update/delete operations and their counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOperationType {
    Create,
    Update,
    Delete,
}

impl BatchOperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchOperationType::Create => "create",
            BatchOperationType::Update => "update",
            BatchOperationType::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemError {
    pub item_index: usize,
    pub message: String,
}

/// Options controlling how a batch is processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Validate every item before any is applied.
    pub validate_first: bool,
    /// Items applied concurrently.
    pub max_concurrency: usize,
    /// Pause between admitting consecutive items.
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "crate::config::duration_str::option"
    )]
    pub item_delay: Option<Duration>,
    /// Keep admitting items after the first failure.
    pub continue_on_error: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            validate_first: true,
            max_concurrency: 3,
            item_delay: None,
            continue_on_error: true,
        }
    }
}

/// A bulk operation over `total_items` items of one target kind.
///
/// `processed_items == successful_items + failed_items <= total_items` holds
/// after every update made through [`record_success`](Self::record_success)
/// and [`record_failure`](Self::record_failure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperation {
    pub id: Uuid,
    pub op_type: BatchOperationType,
    pub target_kind: String,
    pub status: BatchStatus,
    pub total_items: usize,
    pub processed_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub errors: Vec<BatchItemError>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchOperation {
    pub fn new(
        op_type: BatchOperationType,
        target_kind: impl Into<String>,
        total_items: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            op_type,
            target_kind: target_kind.into(),
            status: BatchStatus::Pending,
            total_items,
            processed_items: 0,
            successful_items: 0,
            failed_items: 0,
            errors: Vec::new(),
            created_at: now,
            completed_at: None,
        }
    }

    pub fn record_success(&mut self) {
        if self.processed_items >= self.total_items {
            return;
        }
        self.successful_items += 1;
        self.processed_items += 1;
    }

    pub fn record_failure(&mut self, item_index: usize, message: impl Into<String>) {
        if self.processed_items >= self.total_items {
            return;
        }
        self.failed_items += 1;
        self.processed_items += 1;
        self.errors.push(BatchItemError {
            item_index,
            message: message.into(),
        });
    }

    /// Fraction of items processed, in `0.0..=1.0`. An empty batch is done.
    pub fn progress(&self) -> f64 {
        if self.total_items == 0 {
            return 1.0;
        }
        self.processed_items as f64 / self.total_items as f64
    }

    /// Completed with at least one failed item.
    pub fn is_partial(&self) -> bool {
        self.status == BatchStatus::Completed && self.failed_items > 0
    }

    /// Terminal status for the counters as they stand: `completed` when
    /// nothing failed or anything succeeded, `failed` otherwise.
    pub fn final_status(&self) -> BatchStatus {
        if self.failed_items == 0 || self.successful_items > 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::Failed
        }
    }

    pub fn finish(&mut self, status: BatchStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
    }
}
