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

//! Audit records written for every action the recovery service takes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of recovery action taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryType {
    /// Stale execution failed as interrupted.
    StaleExecutionFailed,
    /// RUNNING task with no open execution failed as interrupted.
    UnstartedTaskFailed,
    /// Interrupted task re-enqueued as a fresh task.
    TaskResubmitted,
    /// Execution closed because its task was already terminal.
    ExecutionSettled,
    /// Orphaned entity promoted because its artifact exists.
    OrphanPromoted,
    /// Orphaned entity failed because its artifact is missing.
    OrphanFailed,
    /// Cancelled task cleaned up.
    CancelledCleanup,
}

impl RecoveryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryType::StaleExecutionFailed => "stale_execution_failed",
            RecoveryType::UnstartedTaskFailed => "unstarted_task_failed",
            RecoveryType::TaskResubmitted => "task_resubmitted",
            RecoveryType::ExecutionSettled => "execution_settled",
            RecoveryType::OrphanPromoted => "orphan_promoted",
            RecoveryType::OrphanFailed => "orphan_failed",
            RecoveryType::CancelledCleanup => "cancelled_cleanup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub id: Uuid,
    pub kind: RecoveryType,
    pub task_id: Option<Uuid>,
    pub execution_id: Option<Uuid>,
    pub entity_id: Option<String>,
    pub details: String,
    pub recovered_at: DateTime<Utc>,
}

impl RecoveryEvent {
    pub fn new(kind: RecoveryType, details: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            task_id: None,
            execution_id: None,
            entity_id: None,
            details: details.into(),
            recovered_at: now,
        }
    }

    pub fn task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn execution(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}
