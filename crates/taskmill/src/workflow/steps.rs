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

//! Step actions.
//!
//! Steps read their inputs from the execution context: `/owner_id` names the
//! owner of created tasks, `/entity_id` and `/working_directory` are copied
//! onto them when present.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{BatchRunner, TaskSink};
use crate::error::StepError;
use crate::events::{EngineEvent, EventBus};
use crate::models::{
    BatchOperationType, BatchStatus, NewTask, StepAction, TaskPayload, WorkflowExecution,
    WorkflowStep,
};

/// Collaborators a step may call.
pub(super) struct StepContext {
    pub sink: Arc<dyn TaskSink>,
    pub batches: Arc<BatchRunner>,
    pub bus: Arc<dyn EventBus>,
}

fn context_str<'a>(execution: &'a WorkflowExecution, pointer: &str) -> Option<&'a str> {
    execution
        .context
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

fn build_task(
    execution: &WorkflowExecution,
    step: &WorkflowStep,
    kind: &str,
    command: &str,
    agent_type: Option<&String>,
    priority: Option<i32>,
) -> Result<NewTask, StepError> {
    let owner_id = context_str(execution, "/owner_id").ok_or_else(|| {
        StepError::Failed(format!(
            "step '{}' needs an owner_id in the execution context",
            step.id
        ))
    })?;

    let mut payload = TaskPayload::command(command);
    payload.metadata = serde_json::json!({
        "workflow_id": execution.workflow_id,
        "workflow_execution_id": execution.id,
        "step_id": step.id,
    });
    if let Some(dir) = context_str(execution, "/working_directory") {
        payload = payload.with_working_directory(dir);
    }
    if let Some(agent_type) = agent_type {
        payload = payload.with_agent_type(agent_type.clone());
    }

    let mut task = NewTask::new(owner_id, kind, payload);
    if let Some(entity_id) = context_str(execution, "/entity_id") {
        task.payload.project_id = Some(entity_id.to_string());
        task = task.with_entity(entity_id);
    }
    if let Some(priority) = priority {
        task = task.with_priority(priority);
    }
    Ok(task)
}

/// Runs one attempt of `step`.
pub(super) async fn run_step(
    ctx: &StepContext,
    step: &WorkflowStep,
    execution: &WorkflowExecution,
    cancel: &CancellationToken,
) -> Result<(), StepError> {
    if cancel.is_cancelled() {
        return Err(StepError::Cancelled);
    }
    debug!(
        "Running step '{}' ({}) of execution {}",
        step.id,
        step.action.type_name(),
        execution.id
    );

    match &step.action {
        StepAction::CreateTasks { tasks } => {
            for template in tasks {
                let task = build_task(
                    execution,
                    step,
                    &template.kind,
                    &template.command,
                    template.agent_type.as_ref(),
                    template.priority,
                )?;
                let queued = ctx
                    .sink
                    .submit(task)
                    .await
                    .map_err(|e| StepError::Failed(e.to_string()))?;
                info!("Step '{}' queued task {}", step.id, queued.id);
            }
            Ok(())
        }

        StepAction::ExecuteAgentInstructions {
            instructions,
            agent_type,
            priority,
        } => {
            let task = build_task(
                execution,
                step,
                "agent-instructions",
                instructions,
                agent_type.as_ref(),
                *priority,
            )?;
            let queued = ctx
                .sink
                .submit(task)
                .await
                .map_err(|e| StepError::Failed(e.to_string()))?;
            info!("Step '{}' queued agent task {}", step.id, queued.id);
            Ok(())
        }

        StepAction::CreateChildEntities { target_kind, items } => {
            let operation = ctx
                .batches
                .create_batch_operation(BatchOperationType::Create, target_kind, items.clone(), None)
                .await
                .map_err(|e| StepError::Failed(e.to_string()))?;
            match operation.status {
                BatchStatus::Completed => Ok(()),
                status => Err(StepError::Failed(format!(
                    "batch {} ended {}: {} of {} item(s) failed",
                    operation.id, status, operation.failed_items, operation.total_items
                ))),
            }
        }

        StepAction::SendNotification { channel, message } => {
            ctx.bus.publish(EngineEvent::Notification {
                channel: channel.clone(),
                message: message.clone(),
                workflow_execution_id: Some(execution.id),
            });
            Ok(())
        }

        StepAction::Wait { duration } => {
            tokio::select! {
                _ = tokio::time::sleep(*duration) => Ok(()),
                _ = cancel.cancelled() => Err(StepError::Cancelled),
            }
        }

        StepAction::Condition { pointer, equals } => match execution.context.pointer(pointer) {
            Some(value) if value == equals => Ok(()),
            Some(value) => Err(StepError::Failed(format!(
                "condition {} expected {} but found {}",
                pointer, equals, value
            ))),
            None => Err(StepError::Failed(format!(
                "condition {} is not present in the execution context",
                pointer
            ))),
        },
    }
}
