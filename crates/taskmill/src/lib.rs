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

//! # Taskmill
//!
//! Taskmill is the orchestration core for asynchronous agent work. It admits
//! tasks into a priority queue, dispatches them one at a time under a token and
//! request budget, runs event-triggered multi-step workflows and bulk batch
//! operations, and reconciles interrupted work after a crash.
//!
//! ## Components
//!
//! - [`TaskQueue`]: admission control, priority ordering and the single-flight
//!   processing loop that calls an [`AgentExecutor`].
//! - [`RateLimiter`]: daily token budget and per-minute request budget; the
//!   source of queue backpressure.
//! - [`WorkflowEngine`]: named workflows of dependency-ordered steps with retry
//!   policies, plus bounded-concurrency batch operations.
//! - [`RecoveryService`]: startup and periodic sweeps that drive stale,
//!   resumable and orphaned work to a terminal state.
//!
//! All durable state goes through the [`Store`] traits. Components are wired
//! together once, through an [`EngineContext`], by [`EngineBuilder`].
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskmill::{EngineBuilder, EngineConfig, EngineContext, MemoryStore, ProcessExecutor};
//!
//! let context = EngineContext::new(Arc::new(MemoryStore::new()), EngineConfig::default());
//! let engine = EngineBuilder::new(context)
//!     .executor(Arc::new(ProcessExecutor::new()))
//!     .build()?;
//!
//! engine.start().await?;
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod models;
pub mod queue;
pub mod rate_limit;
pub mod recovery;
pub mod retry;
pub mod store;
pub mod workflow;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use context::{Engine, EngineBuilder, EngineContext};
pub use error::{
    AdmissionError, BatchError, ConfigError, EngineError, QueueError, RecoveryError, StepError,
    StoreError, WorkflowError,
};
pub use events::{BroadcastEventBus, EngineEvent, EventBus};
pub use executor::{AgentExecutor, ExecuteOptions, ExecutionResult, ProcessExecutor};
pub use models::{
    BatchOperation, BatchOperationType, BatchOptions, BatchStatus, Entity, EntityStatus, NewTask,
    Priority, QueuedTask, RateStatus, TaskExecution, TaskPayload, TaskStatus, WorkflowDefinition,
    WorkflowExecution, WorkflowStatus, WorkflowStep,
};
pub use queue::{
    Admission, OwnerSettings, PauseReason, ProcessOutcome, QueueState, QueueStatus,
    StaticOwnerSettings, TaskQueue,
};
pub use rate_limit::RateLimiter;
pub use recovery::{
    ArtifactProbe, CleanupReport, FsArtifactProbe, NoArtifacts, RecoveryReport, RecoveryService,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{MemoryStore, Store};
pub use workflow::{BatchRunner, EntityHandler, TaskSink, WorkflowEngine};
