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

//! # Engine Events
//!
//! Every state change the engine makes visible is published as an
//! [`EngineEvent`] on an injected [`EventBus`]. The bundled
//! [`BroadcastEventBus`] fans events out over a `tokio::sync::broadcast`
//! channel; subscribers that fall behind lose the oldest events rather than
//! blocking publishers.
//!
//! Event names follow the `scope:action` convention (`task:queued`,
//! `workflow:completed`, ...). The workflow engine uses the name as the
//! trigger key when it listens on the bus.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::models::BatchStatus;
use crate::queue::QueueState;

/// A typed engine event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskQueued {
        task_id: Uuid,
        owner_id: String,
        entity_id: String,
        priority: i32,
    },
    TaskStarted {
        task_id: Uuid,
        execution_id: Uuid,
        owner_id: String,
        entity_id: String,
    },
    TaskCompleted {
        task_id: Uuid,
        execution_id: Uuid,
        owner_id: String,
        entity_id: String,
        tokens_used: u64,
    },
    TaskFailed {
        task_id: Uuid,
        execution_id: Option<Uuid>,
        owner_id: String,
        entity_id: String,
        error: String,
    },
    TaskCancelled {
        task_id: Uuid,
        owner_id: String,
        entity_id: String,
    },
    QueueStatusChanged {
        from: QueueState,
        to: QueueState,
        reason: String,
    },
    BatchCreated {
        batch_id: Uuid,
        target_kind: String,
        total_items: usize,
    },
    BatchProgress {
        batch_id: Uuid,
        processed_items: usize,
        total_items: usize,
    },
    BatchCompleted {
        batch_id: Uuid,
        status: BatchStatus,
        successful_items: usize,
        failed_items: usize,
    },
    BatchCancelled {
        batch_id: Uuid,
    },
    WorkflowStarted {
        execution_id: Uuid,
        workflow_id: String,
    },
    WorkflowCompleted {
        execution_id: Uuid,
        workflow_id: String,
    },
    WorkflowFailed {
        execution_id: Uuid,
        workflow_id: String,
        error: String,
    },
    WorkflowCancelled {
        execution_id: Uuid,
        workflow_id: String,
    },
    Notification {
        channel: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workflow_execution_id: Option<Uuid>,
    },
}

impl EngineEvent {
    /// The `scope:action` name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::TaskQueued { .. } => "task:queued",
            EngineEvent::TaskStarted { .. } => "task:started",
            EngineEvent::TaskCompleted { .. } => "task:completed",
            EngineEvent::TaskFailed { .. } => "task:failed",
            EngineEvent::TaskCancelled { .. } => "task:cancelled",
            EngineEvent::QueueStatusChanged { .. } => "queue:status_changed",
            EngineEvent::BatchCreated { .. } => "batch:created",
            EngineEvent::BatchProgress { .. } => "batch:progress",
            EngineEvent::BatchCompleted { .. } => "batch:completed",
            EngineEvent::BatchCancelled { .. } => "batch:cancelled",
            EngineEvent::WorkflowStarted { .. } => "workflow:started",
            EngineEvent::WorkflowCompleted { .. } => "workflow:completed",
            EngineEvent::WorkflowFailed { .. } => "workflow:failed",
            EngineEvent::WorkflowCancelled { .. } => "workflow:cancelled",
            EngineEvent::Notification { .. } => "notification",
        }
    }

    /// The event serialized as JSON, for use as a workflow trigger context.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Events the workflow engine emits itself and must not react to.
    pub fn is_workflow_event(&self) -> bool {
        matches!(
            self,
            EngineEvent::WorkflowStarted { .. }
                | EngineEvent::WorkflowCompleted { .. }
                | EngineEvent::WorkflowFailed { .. }
                | EngineEvent::WorkflowCancelled { .. }
                | EngineEvent::Notification { .. }
        )
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Publish/subscribe channel for engine events.
pub trait EventBus: Send + Sync + fmt::Debug {
    /// Publishes an event. Never blocks and never fails when nobody listens.
    fn publish(&self, event: EngineEvent);

    /// A receiver for every event published after this call.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

/// [`EventBus`] over a `tokio::sync::broadcast` channel.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: EngineEvent) {
        trace!("Publishing event {}", event.name());
        // An error only means there are no subscribers right now.
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}
