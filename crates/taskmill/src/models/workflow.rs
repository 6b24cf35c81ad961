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

//! Workflow definitions and the executions started from them.
//!
//! Definitions are plain serde data so they can be loaded from JSON:
//!
//! ```json
//! {
//!   "id": "project-bootstrap",
//!   "name": "Project bootstrap",
//!   "triggers": ["project:created"],
//!   "steps": [
//!     { "id": "scaffold", "name": "Scaffold",
//!       "action": { "type": "execute-agent-instructions", "instructions": "init" },
//!       "retry_policy": { "max_attempts": 2, "initial_delay": "5s" } },
//!     { "id": "announce", "name": "Announce", "depends_on": ["scaffold"],
//!       "action": { "type": "send-notification", "channel": "team", "message": "ready" } }
//!   ]
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// A task a `create-tasks` step enqueues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub kind: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
}

/// The closed set of things a workflow step can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepAction {
    /// Batch-create child entities through the entity handler.
    CreateChildEntities {
        target_kind: String,
        items: Vec<serde_json::Value>,
    },
    /// Enqueue one task per template.
    CreateTasks { tasks: Vec<TaskTemplate> },
    /// Enqueue a single agent task running `instructions`.
    ExecuteAgentInstructions {
        instructions: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<i32>,
    },
    /// Publish a `notification` event.
    SendNotification { channel: String, message: String },
    /// Sleep, observing cancellation.
    Wait {
        #[serde(with = "crate::config::duration_str")]
        duration: Duration,
    },
    /// Fail unless the value at `pointer` in the execution context equals `equals`.
    Condition {
        pointer: String,
        equals: serde_json::Value,
    },
}

impl StepAction {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepAction::CreateChildEntities { .. } => "create-child-entities",
            StepAction::CreateTasks { .. } => "create-tasks",
            StepAction::ExecuteAgentInstructions { .. } => "execute-agent-instructions",
            StepAction::SendNotification { .. } => "send-notification",
            StepAction::Wait { .. } => "wait",
            StepAction::Condition { .. } => "condition",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub action: StepAction,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, action: StepAction) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            action,
            depends_on: Vec::new(),
            retry_policy: None,
        }
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub triggers: Vec<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, triggers: Vec<String>, steps: Vec<WorkflowStep>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            triggers,
            steps,
            is_active: true,
        }
    }

    pub fn matches_trigger(&self, event_type: &str) -> bool {
        self.triggers.iter().any(|t| t == event_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    ExecutionStarted,
    StepStarted,
    StepCompleted,
    StepSkipped,
    StepRetry,
    StepFailed,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowLogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub kind: LogKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

/// One run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: String,
    pub trigger_event: Option<String>,
    pub context: serde_json::Value,
    pub status: WorkflowStatus,
    pub completed_steps: BTreeSet<String>,
    pub skipped_steps: BTreeSet<String>,
    pub progress: f64,
    pub logs: Vec<WorkflowLogEntry>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn start(
        workflow_id: impl Into<String>,
        trigger_event: Option<String>,
        context: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            trigger_event,
            context,
            status: WorkflowStatus::Running,
            completed_steps: BTreeSet::new(),
            skipped_steps: BTreeSet::new(),
            progress: 0.0,
            logs: Vec::new(),
            error: None,
            started_at: now,
            completed_at: None,
        }
    }

    pub fn log(
        &mut self,
        at: DateTime<Utc>,
        level: LogLevel,
        kind: LogKind,
        step_id: Option<&str>,
        message: impl Into<String>,
    ) {
        self.logs.push(WorkflowLogEntry {
            at,
            level,
            kind,
            step_id: step_id.map(str::to_string),
            message: message.into(),
        });
    }

    /// Marks `step_id` completed and recomputes progress over `total_steps`.
    pub fn complete_step(&mut self, step_id: &str, total_steps: usize) {
        self.completed_steps.insert(step_id.to_string());
        self.progress = if total_steps == 0 {
            1.0
        } else {
            self.completed_steps.len() as f64 / total_steps as f64
        };
    }

    /// Dependencies of a step not yet completed in this execution.
    pub fn unmet_dependencies(&self, step: &WorkflowStep) -> Vec<String> {
        step.depends_on
            .iter()
            .filter(|dep| !self.completed_steps.contains(*dep))
            .cloned()
            .collect()
    }

    /// Log entries of `kind` for `step_id`.
    pub fn log_entries<'a>(
        &'a self,
        kind: LogKind,
        step_id: &'a str,
    ) -> impl Iterator<Item = &'a WorkflowLogEntry> + 'a {
        self.logs
            .iter()
            .filter(move |e| e.kind == kind && e.step_id.as_deref() == Some(step_id))
    }

    pub fn finish(&mut self, status: WorkflowStatus, error: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(now);
    }
}
