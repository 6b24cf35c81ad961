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

//! Domain records persisted through the [`Store`](crate::store::Store).

pub mod batch;
pub mod entity;
pub mod execution;
pub mod rate;
pub mod recovery_event;
pub mod task;
pub mod workflow;

pub use batch::{BatchItemError, BatchOperation, BatchOperationType, BatchOptions, BatchStatus};
pub use entity::{Entity, EntityStatus};
pub use execution::{ExecutionStatus, Phase, PhaseStatus, TaskExecution};
pub use rate::{RateStatus, RateUsage};
pub use recovery_event::{RecoveryEvent, RecoveryType};
pub use task::{NewTask, Priority, QueuedTask, TaskPayload, TaskStatus, TaskUpdate};
pub use workflow::{
    LogKind, LogLevel, StepAction, TaskTemplate, WorkflowDefinition, WorkflowExecution,
    WorkflowLogEntry, WorkflowStatus, WorkflowStep,
};
