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

//! Error types for the orchestration engine.
//!
//! Errors are split by the boundary they cross. Admission and validation
//! errors are returned synchronously to the caller that triggered them.
//! Anything that happens after a task has been accepted (executor failures,
//! exhausted retries, stale executions) is recorded as state on the affected
//! record and reported through events instead of being returned.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by [`Store`](crate::store::Store) implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    Duplicate { kind: &'static str, id: String },

    #[error("Invalid status transition for {kind} {id}: {from} -> {to}")]
    InvalidTransition {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Returned by [`TaskQueue::enqueue`](crate::queue::TaskQueue::enqueue) when
/// the owner's queue is already at capacity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Queue full for owner {owner_id}: {current_size}/{max_size} ({reason})")]
pub struct AdmissionError {
    pub owner_id: String,
    pub current_size: usize,
    pub max_size: usize,
    pub reason: String,
}

/// Errors returned by task queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Why a single agent execution did not succeed.
///
/// These never escape the processing loop; they are rendered into the
/// `error` field of the task and its execution record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Failed to start command: {0}")]
    Spawn(String),

    #[error("Command exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
}

/// Phase bookkeeping violations on a [`TaskExecution`](crate::models::TaskExecution).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PhaseError {
    #[error("Phase {0} is already active")]
    AlreadyActive(String),

    #[error("Phase {phase} cannot start while earlier phase {blocking} is incomplete")]
    OutOfOrder { phase: String, blocking: String },

    #[error("No phase is active")]
    NoActivePhase,

    #[error("No pending phase left")]
    NoPendingPhase,
}

/// A batch item rejected by up-front validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A batch item that failed while being applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ItemError {
    pub message: String,
}

impl ItemError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Outcome of a workflow step that did not complete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("Step '{step_id}' skipped: unmet dependencies {missing:?}")]
    DependencyUnmet { step_id: String, missing: Vec<String> },

    #[error("Step '{step_id}' failed after {attempts} attempt(s): {last_error}")]
    RetryExhausted {
        step_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{0}")]
    Failed(String),

    #[error("Workflow execution cancelled")]
    Cancelled,
}

/// Errors returned by workflow registration and execution.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid workflow definition '{workflow_id}': {message}")]
    InvalidDefinition {
        workflow_id: String,
        message: String,
    },

    #[error("Workflow '{workflow_id}' has a dependency cycle involving step '{step_id}'")]
    CyclicDependency {
        workflow_id: String,
        step_id: String,
    },

    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Workflow is not active: {0}")]
    Inactive(String),

    #[error("Workflow execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors returned by batch operations.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Invalid batch options: {0}")]
    InvalidOptions(String),

    #[error("Batch operation not found: {0}")]
    NotFound(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Raised by recovery when an execution outlived the staleness threshold.
///
/// Its display form is the failure reason written onto the execution, the
/// task and the owning entity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("interrupted: execution {execution_id} of task {task_id} was left running for {age_minutes} minute(s)")]
pub struct StaleTaskError {
    pub execution_id: Uuid,
    pub task_id: Uuid,
    pub age_minutes: i64,
}

/// Failure reported by an [`ArtifactProbe`](crate::recovery::ArtifactProbe).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Artifact probe failed: {0}")]
pub struct ProbeError(pub String);

/// Errors returned by recovery sweeps.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid duration '{value}': {message}")]
    InvalidDuration { value: String, message: String },

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Errors raised while assembling or starting an [`Engine`](crate::context::Engine).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No agent executor configured")]
    MissingExecutor,

    #[error("Engine already started")]
    AlreadyStarted,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),
}
