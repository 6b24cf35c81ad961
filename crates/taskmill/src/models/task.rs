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

//! Queued task records and their status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle status of a queued task.
///
/// Valid edges are `PENDING -> RUNNING -> {COMPLETED, FAILED}` and
/// `{PENDING, RUNNING} -> CANCELLED`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the status machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("unknown task status: {}", s)),
        }
    }
}

/// Discrete priority bands used when a task does not specify a priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Integer priority of the band. Higher runs first.
    pub fn value(&self) -> i32 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 5,
            Priority::High => 8,
            Priority::Critical => 10,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(format!("unknown priority band: {}", s)),
        }
    }
}

/// What the agent executor is asked to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl TaskPayload {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_directory: None,
            agent_type: None,
            project_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }
}

/// A unit of agent work owned by the task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: Uuid,
    /// Owner whose queue quota this task counts against.
    pub owner_id: String,
    /// Entity the task works on; failures cascade to it during recovery.
    pub entity_id: String,
    pub kind: String,
    pub payload: TaskPayload,
    pub priority: i32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl QueuedTask {
    /// Builds a PENDING task from an admitted request.
    pub fn from_new(new_task: NewTask, priority: i32, now: DateTime<Utc>) -> Self {
        let entity_id = new_task
            .entity_id
            .unwrap_or_else(|| new_task.owner_id.clone());
        Self {
            id: Uuid::new_v4(),
            owner_id: new_task.owner_id,
            entity_id,
            kind: new_task.kind,
            payload: new_task.payload,
            priority,
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
        }
    }

    /// A fresh request carrying the same work, used when recovery resubmits.
    pub fn to_new_task(&self) -> NewTask {
        NewTask {
            owner_id: self.owner_id.clone(),
            entity_id: Some(self.entity_id.clone()),
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            priority: Some(self.priority),
        }
    }
}

/// Request to enqueue a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub owner_id: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    pub kind: String,
    pub payload: TaskPayload,
    /// Explicit priority; the owner's default band applies when absent.
    #[serde(default)]
    pub priority: Option<i32>,
}

impl NewTask {
    pub fn new(owner_id: impl Into<String>, kind: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            owner_id: owner_id.into(),
            entity_id: None,
            kind: kind.into(),
            payload,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_band(self, band: Priority) -> Self {
        self.with_priority(band.value())
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

/// A guarded status change applied by [`TaskStore::transition_task`](crate::store::TaskStore::transition_task).
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl TaskUpdate {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Running,
            at,
            output: None,
            error: None,
        }
    }

    pub fn completed(at: DateTime<Utc>, output: Option<String>) -> Self {
        Self {
            status: TaskStatus::Completed,
            at,
            output,
            error: None,
        }
    }

    pub fn failed(at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            at,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn cancelled(at: DateTime<Utc>, reason: Option<String>) -> Self {
        Self {
            status: TaskStatus::Cancelled,
            at,
            output: None,
            error: reason,
        }
    }

    /// Applies the update to `task`, stamping the lifecycle timestamps.
    pub fn apply(&self, task: &mut QueuedTask) {
        task.status = self.status;
        match self.status {
            TaskStatus::Running => task.started_at = Some(self.at),
            status if status.is_terminal() => task.completed_at = Some(self.at),
            _ => {}
        }
        if self.output.is_some() {
            task.output = self.output.clone();
        }
        if self.error.is_some() {
            task.error = self.error.clone();
        }
    }
}
