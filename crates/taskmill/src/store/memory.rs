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

//! In-process [`Store`](super::Store) backed by `parking_lot` locked maps.
//!
//! Each guarded transition holds the write lock for the whole
//! compare-and-set, so concurrent callers observe a single winner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use super::{
    BatchStore, EntityStore, ExecutionStore, RateUsageStore, RecoveryEventStore, TaskStore,
    WorkflowStore,
};
use crate::error::StoreError;
use crate::models::{
    BatchOperation, Entity, EntityStatus, ExecutionStatus, QueuedTask, RateUsage, RecoveryEvent,
    TaskExecution, TaskStatus, TaskUpdate, WorkflowDefinition, WorkflowExecution,
};

#[derive(Debug, Clone)]
struct TaskRow {
    seq: u64,
    task: QueuedTask,
}

#[derive(Debug, Clone)]
struct ExecutionRow {
    seq: u64,
    execution: TaskExecution,
}

/// Volatile store holding every record in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    seq: AtomicU64,
    tasks: RwLock<HashMap<Uuid, TaskRow>>,
    executions: RwLock<HashMap<Uuid, ExecutionRow>>,
    rate_usage: RwLock<Option<RateUsage>>,
    entities: RwLock<HashMap<String, Entity>>,
    batches: RwLock<HashMap<Uuid, BatchOperation>>,
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
    workflow_executions: RwLock<HashMap<Uuid, (u64, WorkflowExecution)>>,
    recovery_events: RwLock<Vec<RecoveryEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: QueuedTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate {
                kind: "task",
                id: task.id.to_string(),
            });
        }
        let seq = self.next_seq();
        tasks.insert(task.id, TaskRow { seq, task });
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<QueuedTask>, StoreError> {
        Ok(self.tasks.read().get(&id).map(|row| row.task.clone()))
    }

    async fn transition_task(
        &self,
        id: Uuid,
        expected: &[TaskStatus],
        update: TaskUpdate,
    ) -> Result<Option<QueuedTask>, StoreError> {
        let mut tasks = self.tasks.write();
        let row = tasks.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            kind: "task",
            id: id.to_string(),
        })?;

        let current = row.task.status;
        if !expected.contains(&current) {
            return Ok(None);
        }
        if !current.can_transition_to(update.status) {
            return Err(StoreError::InvalidTransition {
                kind: "task",
                id: id.to_string(),
                from: current.to_string(),
                to: update.status.to_string(),
            });
        }

        update.apply(&mut row.task);
        Ok(Some(row.task.clone()))
    }

    async fn next_pending_task(&self) -> Result<Option<QueuedTask>, StoreError> {
        let tasks = self.tasks.read();
        let next = tasks
            .values()
            .filter(|row| row.task.status == TaskStatus::Pending)
            .min_by(|a, b| {
                b.task
                    .priority
                    .cmp(&a.task.priority)
                    .then(a.task.created_at.cmp(&b.task.created_at))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|row| row.task.clone());
        Ok(next)
    }

    async fn count_active_for_owner(&self, owner_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|row| {
                row.task.owner_id == owner_id
                    && matches!(row.task.status, TaskStatus::Pending | TaskStatus::Running)
            })
            .count())
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<usize, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|row| row.task.status == status)
            .count())
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<QueuedTask>, StoreError> {
        let tasks = self.tasks.read();
        let mut rows: Vec<&TaskRow> = tasks
            .values()
            .filter(|row| row.task.status == status)
            .collect();
        rows.sort_by_key(|row| row.seq);
        Ok(rows.into_iter().map(|row| row.task.clone()).collect())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn insert_execution(&self, execution: TaskExecution) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        if executions.contains_key(&execution.id) {
            return Err(StoreError::Duplicate {
                kind: "execution",
                id: execution.id.to_string(),
            });
        }
        let seq = self.next_seq();
        executions.insert(execution.id, ExecutionRow { seq, execution });
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<TaskExecution>, StoreError> {
        Ok(self
            .executions
            .read()
            .get(&id)
            .map(|row| row.execution.clone()))
    }

    async fn save_execution_progress(&self, execution: &TaskExecution) -> Result<bool, StoreError> {
        let mut executions = self.executions.write();
        let row = executions
            .get_mut(&execution.id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "execution",
                id: execution.id.to_string(),
            })?;

        if row.execution.status.is_terminal() {
            return Ok(false);
        }
        row.execution = execution.clone();
        Ok(true)
    }

    async fn transition_execution(
        &self,
        id: Uuid,
        expected: &[ExecutionStatus],
        to: ExecutionStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Option<TaskExecution>, StoreError> {
        let mut executions = self.executions.write();
        let row = executions.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            kind: "execution",
            id: id.to_string(),
        })?;

        let current = row.execution.status;
        if !expected.contains(&current) {
            return Ok(None);
        }
        if current.is_terminal() {
            return Err(StoreError::InvalidTransition {
                kind: "execution",
                id: id.to_string(),
                from: current.to_string(),
                to: to.to_string(),
            });
        }

        match to {
            ExecutionStatus::Completed => row.execution.mark_completed(at),
            ExecutionStatus::Failed => {
                row.execution
                    .mark_failed(error.unwrap_or_else(|| "failed".to_string()), at)
            }
            ExecutionStatus::Running => {
                row.execution.status = ExecutionStatus::Running;
                row.execution.started_at.get_or_insert(at);
                row.execution.updated_at = at;
            }
            ExecutionStatus::Pending => {
                row.execution.status = ExecutionStatus::Pending;
                row.execution.updated_at = at;
            }
        }
        Ok(Some(row.execution.clone()))
    }

    async fn list_non_terminal_executions(
        &self,
        created_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let executions = self.executions.read();
        let mut rows: Vec<&ExecutionRow> = executions
            .values()
            .filter(|row| !row.execution.status.is_terminal())
            .filter(|row| created_before.map_or(true, |cutoff| row.execution.created_at < cutoff))
            .collect();
        rows.sort_by_key(|row| row.seq);
        Ok(rows.into_iter().map(|row| row.execution.clone()).collect())
    }

    async fn executions_for_task(&self, task_id: Uuid) -> Result<Vec<TaskExecution>, StoreError> {
        let executions = self.executions.read();
        let mut rows: Vec<&ExecutionRow> = executions
            .values()
            .filter(|row| row.execution.task_id == task_id)
            .collect();
        rows.sort_by_key(|row| row.seq);
        Ok(rows.into_iter().map(|row| row.execution.clone()).collect())
    }

    async fn executions_for_entity(&self, entity_id: &str) -> Result<Vec<TaskExecution>, StoreError> {
        let executions = self.executions.read();
        let mut rows: Vec<&ExecutionRow> = executions
            .values()
            .filter(|row| row.execution.entity_id == entity_id)
            .collect();
        rows.sort_by_key(|row| row.seq);
        Ok(rows.into_iter().map(|row| row.execution.clone()).collect())
    }
}

#[async_trait]
impl RateUsageStore for MemoryStore {
    async fn load_rate_usage(&self) -> Result<Option<RateUsage>, StoreError> {
        Ok(self.rate_usage.read().clone())
    }

    async fn save_rate_usage(&self, usage: &RateUsage) -> Result<(), StoreError> {
        *self.rate_usage.write() = Some(usage.clone());
        Ok(())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn upsert_entity(&self, entity: Entity) -> Result<(), StoreError> {
        self.entities.write().insert(entity.id.clone(), entity);
        Ok(())
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>, StoreError> {
        Ok(self.entities.read().get(id).cloned())
    }

    async fn transition_entity(
        &self,
        id: &str,
        expected: &[EntityStatus],
        to: EntityStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Option<Entity>, StoreError> {
        let mut entities = self.entities.write();
        let Some(entity) = entities.get_mut(id) else {
            return Ok(None);
        };
        if !expected.contains(&entity.status) {
            return Ok(None);
        }

        entity.status = to;
        entity.updated_at = at;
        if reason.is_some() {
            entity.failure_reason = reason;
        }
        Ok(Some(entity.clone()))
    }

    async fn list_entities_by_status(
        &self,
        status: EntityStatus,
        created_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, StoreError> {
        let mut entities: Vec<Entity> = self
            .entities
            .read()
            .values()
            .filter(|e| e.status == status)
            .filter(|e| created_before.map_or(true, |cutoff| e.created_at < cutoff))
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(entities)
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn save_batch(&self, operation: &BatchOperation) -> Result<(), StoreError> {
        self.batches.write().insert(operation.id, operation.clone());
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<BatchOperation>, StoreError> {
        Ok(self.batches.read().get(&id).cloned())
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save_workflow(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        self.workflows
            .write()
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.workflows.read().get(id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut workflows: Vec<WorkflowDefinition> =
            self.workflows.read().values().cloned().collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workflows)
    }

    async fn save_workflow_execution(&self, execution: &WorkflowExecution) -> Result<bool, StoreError> {
        let mut executions = self.workflow_executions.write();
        match executions.get_mut(&execution.id) {
            Some((_, stored)) if stored.status.is_terminal() => Ok(false),
            Some((_, stored)) => {
                *stored = execution.clone();
                Ok(true)
            }
            None => {
                let seq = self.next_seq();
                executions.insert(execution.id, (seq, execution.clone()));
                Ok(true)
            }
        }
    }

    async fn get_workflow_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self
            .workflow_executions
            .read()
            .get(&id)
            .map(|(_, execution)| execution.clone()))
    }

    async fn list_workflow_executions(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let executions = self.workflow_executions.read();
        let mut rows: Vec<&(u64, WorkflowExecution)> = executions
            .values()
            .filter(|(_, e)| e.workflow_id == workflow_id)
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, e)| e.clone()).collect())
    }
}

#[async_trait]
impl RecoveryEventStore for MemoryStore {
    async fn record_recovery_event(&self, event: RecoveryEvent) -> Result<(), StoreError> {
        self.recovery_events.write().push(event);
        Ok(())
    }

    async fn list_recovery_events(&self) -> Result<Vec<RecoveryEvent>, StoreError> {
        Ok(self.recovery_events.read().clone())
    }
}
