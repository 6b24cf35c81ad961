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

//! # Workflow Engine
//!
//! Event-triggered workflows and bulk batch operations.
//!
//! A workflow is an ordered list of steps. Steps run sequentially in declared
//! order; a step whose dependencies have not all completed is skipped with a
//! warning and does not block the steps after it. A failing step is retried
//! per its [`RetryPolicy`](crate::retry::RetryPolicy); once retries run out
//! the whole execution fails.
//!
//! Batch operations hand each item to an [`EntityHandler`] through a bounded
//! pool of concurrent workers.
//!
//! The engine reaches the rest of the system through two seams:
//! [`TaskSink`] for enqueueing agent work and [`EntityHandler`] for applying
//! batch items.

mod batch;
mod engine;
mod steps;

pub use batch::BatchRunner;
pub use engine::WorkflowEngine;

use async_trait::async_trait;

use crate::error::{ItemError, QueueError, ValidationError};
use crate::models::{BatchOperationType, NewTask, QueuedTask};
use crate::queue::TaskQueue;

/// Destination for tasks created by workflow steps.
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn submit(&self, task: NewTask) -> Result<QueuedTask, QueueError>;
}

#[async_trait]
impl TaskSink for TaskQueue {
    async fn submit(&self, task: NewTask) -> Result<QueuedTask, QueueError> {
        self.enqueue(task).await
    }
}

/// Applies batch items of a target kind.
#[async_trait]
pub trait EntityHandler: Send + Sync {
    /// Checks an item before any item of the batch is applied.
    async fn validate(
        &self,
        op: BatchOperationType,
        target_kind: &str,
        item: &serde_json::Value,
    ) -> Result<(), ValidationError>;

    /// Creates, updates or deletes the entity the item describes.
    async fn apply(
        &self,
        op: BatchOperationType,
        target_kind: &str,
        item: &serde_json::Value,
    ) -> Result<(), ItemError>;
}
