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

//! Persistence abstraction.
//!
//! Every durable record goes through the traits in this module. They are
//! split by record family, and [`Store`] is the union every component takes
//! as `Arc<dyn Store>`.
//!
//! Status changes are guarded: a transition names the statuses the record is
//! expected to be in and only applies when the current status matches. A
//! transition whose guard does not match returns `Ok(None)`, which lets the
//! queue, the recovery service and cancellation race on the same record
//! without overwriting each other. An edge the status machine forbids is an
//! error.
//!
//! ```rust,ignore
//! let claimed = store
//!     .transition_task(task.id, &[TaskStatus::Pending], TaskUpdate::started(now))
//!     .await?;
//! if claimed.is_none() {
//!     // someone else moved it first
//! }
//! ```

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    BatchOperation, Entity, EntityStatus, ExecutionStatus, QueuedTask, RateUsage, RecoveryEvent,
    TaskExecution, TaskStatus, TaskUpdate, WorkflowDefinition, WorkflowExecution,
};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: QueuedTask) -> Result<(), StoreError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<QueuedTask>, StoreError>;

    /// Applies `update` if the task is currently in one of `expected`.
    ///
    /// # Returns
    ///
    /// The updated task, or `None` if the guard did not match.
    async fn transition_task(
        &self,
        id: Uuid,
        expected: &[TaskStatus],
        update: TaskUpdate,
    ) -> Result<Option<QueuedTask>, StoreError>;

    /// Highest-priority PENDING task, earliest `created_at` first among equals.
    async fn next_pending_task(&self) -> Result<Option<QueuedTask>, StoreError>;

    /// PENDING plus RUNNING tasks of `owner_id`.
    async fn count_active_for_owner(&self, owner_id: &str) -> Result<usize, StoreError>;

    async fn count_by_status(&self, status: TaskStatus) -> Result<usize, StoreError>;

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<QueuedTask>, StoreError>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert_execution(&self, execution: TaskExecution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<TaskExecution>, StoreError>;

    /// Overwrites phases, attempts and token counts of a non-terminal execution.
    ///
    /// Returns `false` without writing when the stored record is already
    /// terminal.
    async fn save_execution_progress(&self, execution: &TaskExecution) -> Result<bool, StoreError>;

    /// Moves an execution to `to` if it is currently in one of `expected`.
    async fn transition_execution(
        &self,
        id: Uuid,
        expected: &[ExecutionStatus],
        to: ExecutionStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Option<TaskExecution>, StoreError>;

    /// PENDING and RUNNING executions, optionally only those created before
    /// `created_before`.
    async fn list_non_terminal_executions(
        &self,
        created_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<TaskExecution>, StoreError>;

    async fn executions_for_task(&self, task_id: Uuid) -> Result<Vec<TaskExecution>, StoreError>;

    async fn executions_for_entity(&self, entity_id: &str) -> Result<Vec<TaskExecution>, StoreError>;
}

#[async_trait]
pub trait RateUsageStore: Send + Sync {
    async fn load_rate_usage(&self) -> Result<Option<RateUsage>, StoreError>;

    async fn save_rate_usage(&self, usage: &RateUsage) -> Result<(), StoreError>;
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn upsert_entity(&self, entity: Entity) -> Result<(), StoreError>;

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>, StoreError>;

    /// Moves an entity to `to` if it is currently in one of `expected`.
    async fn transition_entity(
        &self,
        id: &str,
        expected: &[EntityStatus],
        to: EntityStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Option<Entity>, StoreError>;

    async fn list_entities_by_status(
        &self,
        status: EntityStatus,
        created_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, StoreError>;
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn save_batch(&self, operation: &BatchOperation) -> Result<(), StoreError>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<BatchOperation>, StoreError>;
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn save_workflow(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, StoreError>;

    /// Writes a workflow execution unless the stored copy is already
    /// terminal. Returns whether the write happened.
    async fn save_workflow_execution(&self, execution: &WorkflowExecution) -> Result<bool, StoreError>;

    async fn get_workflow_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError>;

    async fn list_workflow_executions(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;
}

#[async_trait]
pub trait RecoveryEventStore: Send + Sync {
    async fn record_recovery_event(&self, event: RecoveryEvent) -> Result<(), StoreError>;

    async fn list_recovery_events(&self) -> Result<Vec<RecoveryEvent>, StoreError>;
}

/// Every record family in one object.
pub trait Store:
    std::fmt::Debug
    + TaskStore
    + ExecutionStore
    + RateUsageStore
    + EntityStore
    + BatchStore
    + WorkflowStore
    + RecoveryEventStore
{
}

impl<T> Store for T where
    T: std::fmt::Debug
        + TaskStore
        + ExecutionStore
        + RateUsageStore
        + EntityStore
        + BatchStore
        + WorkflowStore
        + RecoveryEventStore
{
}

