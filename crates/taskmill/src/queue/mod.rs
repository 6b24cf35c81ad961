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

//! # Task Queue
//!
//! The queue admits tasks per owner, orders them by priority and runs them
//! one at a time through the [`AgentExecutor`].
//!
//! ## Processing
//!
//! [`TaskQueue::process_next_task`] is single-flight: a second concurrent
//! call returns [`ProcessOutcome::Busy`] immediately. One invocation
//!
//! 1. returns early while the queue is paused,
//! 2. consults the [`RateLimiter`] and pauses the queue when the budget is
//!    exhausted,
//! 3. claims the best PENDING task with a guarded `PENDING -> RUNNING`
//!    transition and opens a [`TaskExecution`],
//! 4. runs the executor under a hard timeout, retrying per the configured
//!    [`RetryPolicy`](crate::retry::RetryPolicy),
//! 5. records token usage and moves the task to COMPLETED or FAILED, and
//! 6. wakes the loop again after a short delay if work remains.
//!
//! [`TaskQueue::start`] drives this from a background task that sleeps on a
//! [`Notify`] between runs. Enqueue, resume and rate-window auto-resume all
//! wake it; there is no fixed polling interval.
//!
//! ## Cancellation
//!
//! Each claimed task gets a [`CancellationToken`] that is handed to the
//! executor. [`TaskQueue::cancel_task`] moves the task to CANCELLED first and
//! then fires the token, so a late executor result never overwrites the
//! cancellation.

mod settings;

pub use settings::{Admission, OwnerSettings, StaticOwnerSettings};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{AdmissionError, ExecutionError, QueueError, StoreError};
use crate::events::{EngineEvent, EventBus};
use crate::executor::{AgentExecutor, ExecuteOptions, ExecutionResult};
use crate::models::{
    ExecutionStatus, NewTask, PhaseStatus, QueuedTask, RateStatus, TaskExecution, TaskStatus,
    TaskUpdate,
};
use crate::rate_limit::RateLimiter;
use crate::store::Store;

/// Whether the queue dispatches work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    Active,
    Paused,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueState::Active => f.write_str("ACTIVE"),
            QueueState::Paused => f.write_str("PAUSED"),
        }
    }
}

/// Why a paused queue is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Manual,
    RateLimited,
}

impl PauseReason {
    fn as_str(&self) -> &'static str {
        match self {
            PauseReason::Manual => "manual",
            PauseReason::RateLimited => "rate_limited",
        }
    }
}

/// Result of one [`TaskQueue::process_next_task`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Another invocation is already running.
    Busy,
    /// The queue is paused; nothing was dequeued.
    Paused,
    /// The rate budget is exhausted; the queue is now paused.
    RateLimited,
    /// No PENDING task exists.
    Idle,
    /// A task was run and ended in `status`.
    Processed { task_id: Uuid, status: TaskStatus },
    /// The store failed; the loop will retry.
    StoreUnavailable,
}

/// Snapshot returned by [`TaskQueue::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub state: QueueState,
    pub pause_reason: Option<PauseReason>,
    pub pending: usize,
    pub running: usize,
    pub rate: RateStatus,
}

#[derive(Debug)]
struct Control {
    state: QueueState,
    pause_reason: Option<PauseReason>,
}

/// Releases the single-flight flag when dropped.
struct SingleFlight<'a>(&'a AtomicBool);

impl<'a> SingleFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SingleFlight(flag))
    }
}

impl Drop for SingleFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Shortest wait between auto-resume checks.
const MIN_RESUME_WAIT: Duration = Duration::from_millis(100);

/// Priority task queue with admission control and a single-flight processor.
pub struct TaskQueue {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    rate_limiter: Arc<RateLimiter>,
    executor: Arc<dyn AgentExecutor>,
    settings: Arc<dyn OwnerSettings>,
    config: QueueConfig,
    control: Mutex<Control>,
    processing: AtomicBool,
    resume_armed: AtomicBool,
    admission: tokio::sync::Mutex<()>,
    wake: Arc<Notify>,
    in_flight: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let control = self.control.lock();
        f.debug_struct("TaskQueue")
            .field("state", &control.state)
            .field("pause_reason", &control.pause_reason)
            .field("processing", &self.processing.load(Ordering::Relaxed))
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        rate_limiter: Arc<RateLimiter>,
        executor: Arc<dyn AgentExecutor>,
        settings: Arc<dyn OwnerSettings>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            rate_limiter,
            executor,
            settings,
            config,
            control: Mutex::new(Control {
                state: QueueState::Active,
                pause_reason: None,
            }),
            processing: AtomicBool::new(false),
            resume_armed: AtomicBool::new(false),
            admission: tokio::sync::Mutex::new(()),
            wake: Arc::new(Notify::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Admits a task for its owner.
    ///
    /// # Arguments
    ///
    /// * `new_task` - The task request. Without a priority, the owner's
    ///   default band applies.
    ///
    /// # Returns
    ///
    /// The persisted PENDING task, or [`QueueError::Admission`] when the
    /// owner already holds its maximum of PENDING plus RUNNING tasks.
    pub async fn enqueue(&self, new_task: NewTask) -> Result<QueuedTask, QueueError> {
        if new_task.owner_id.trim().is_empty() {
            return Err(QueueError::InvalidPayload("owner_id is empty".to_string()));
        }
        if new_task.payload.command.trim().is_empty() {
            return Err(QueueError::InvalidPayload("command is empty".to_string()));
        }

        // Check and insert under one lock so concurrent enqueues cannot
        // overshoot the owner's limit.
        let _admission = self.admission.lock().await;

        let admission = self.can_enqueue(&new_task.owner_id).await?;
        if !admission.allowed {
            warn!(
                "Rejected task for owner {}: {}/{} active",
                new_task.owner_id, admission.current_size, admission.max_size
            );
            return Err(AdmissionError {
                owner_id: new_task.owner_id,
                current_size: admission.current_size,
                max_size: admission.max_size,
                reason: admission.reason.unwrap_or_default(),
            }
            .into());
        }

        let priority = match new_task.priority {
            Some(priority) => priority,
            None => self.settings.default_priority(&new_task.owner_id).await.value(),
        };
        let task = QueuedTask::from_new(new_task, priority, self.clock.now());
        self.store.insert_task(task.clone()).await?;

        info!(
            "Task queued (task: {}, owner: {}, kind: {}, priority: {})",
            task.id, task.owner_id, task.kind, task.priority
        );
        self.bus.publish(EngineEvent::TaskQueued {
            task_id: task.id,
            owner_id: task.owner_id.clone(),
            entity_id: task.entity_id.clone(),
            priority: task.priority,
        });
        self.wake.notify_one();

        Ok(task)
    }

    /// Whether `owner_id` could enqueue another task right now.
    pub async fn can_enqueue(&self, owner_id: &str) -> Result<Admission, QueueError> {
        let current = self.store.count_active_for_owner(owner_id).await?;
        let max = self.settings.max_queue_size(owner_id).await;
        Ok(Admission::evaluate(current, max))
    }

    /// Runs at most one PENDING task to completion.
    pub async fn process_next_task(&self) -> ProcessOutcome {
        let Some(_flight) = SingleFlight::acquire(&self.processing) else {
            debug!("Task processing already in progress");
            return ProcessOutcome::Busy;
        };

        if self.state() == QueueState::Paused {
            return ProcessOutcome::Paused;
        }

        match self.rate_limiter.can_proceed().await {
            Ok(true) => {}
            Ok(false) => {
                self.transition_state(QueueState::Paused, Some(PauseReason::RateLimited));
                return ProcessOutcome::RateLimited;
            }
            Err(e) => {
                error!("Failed to read rate limit status: {}", e);
                self.schedule_wake(self.config.reschedule_delay);
                return ProcessOutcome::StoreUnavailable;
            }
        }

        let (task, cancel) = match self.claim_next().await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return ProcessOutcome::Idle,
            Err(e) => {
                error!("Failed to claim next task: {}", e);
                self.schedule_wake(self.config.reschedule_delay);
                return ProcessOutcome::StoreUnavailable;
            }
        };

        let task_id = task.id;
        let outcome = match self.run_claimed(task, cancel).await {
            Ok(status) => ProcessOutcome::Processed { task_id, status },
            Err(e) => {
                error!("Failed to persist result of task {}: {}", task_id, e);
                ProcessOutcome::StoreUnavailable
            }
        };
        self.in_flight.lock().remove(&task_id);

        match self.store.count_by_status(TaskStatus::Pending).await {
            Ok(0) => {}
            Ok(pending) => {
                debug!("{} pending task(s) remain; rescheduling", pending);
                self.schedule_wake(self.config.reschedule_delay);
            }
            Err(e) => {
                warn!("Failed to count pending tasks: {}", e);
                self.schedule_wake(self.config.reschedule_delay);
            }
        }

        outcome
    }

    /// Claims the best PENDING task. Skips candidates that moved between
    /// the read and the guarded transition.
    async fn claim_next(&self) -> Result<Option<(QueuedTask, CancellationToken)>, StoreError> {
        loop {
            let Some(candidate) = self.store.next_pending_task().await? else {
                return Ok(None);
            };
            // Registered before the claim so recovery never sees a RUNNING
            // task of ours that is not marked in flight.
            let cancel = CancellationToken::new();
            self.in_flight.lock().insert(candidate.id, cancel.clone());
            let claimed = self
                .store
                .transition_task(
                    candidate.id,
                    &[TaskStatus::Pending],
                    TaskUpdate::started(self.clock.now()),
                )
                .await;
            match claimed {
                Ok(Some(task)) => return Ok(Some((task, cancel))),
                Ok(None) => {
                    self.in_flight.lock().remove(&candidate.id);
                    debug!("Task {} moved before it could be claimed", candidate.id);
                }
                Err(e) => {
                    self.in_flight.lock().remove(&candidate.id);
                    return Err(e);
                }
            }
        }
    }

    async fn run_claimed(
        &self,
        task: QueuedTask,
        cancel: CancellationToken,
    ) -> Result<TaskStatus, StoreError> {
        let now = self.clock.now();
        let mut execution =
            TaskExecution::start(task.id, task.entity_id.clone(), &self.config.phases, now);
        if let Err(e) = self.store.insert_execution(execution.clone()).await {
            let reason = format!("failed to record execution: {}", e);
            error!("Task {}: {}", task.id, reason);
            self.store
                .transition_task(task.id, &[TaskStatus::Running], TaskUpdate::failed(now, &reason))
                .await?;
            self.bus.publish(EngineEvent::TaskFailed {
                task_id: task.id,
                execution_id: None,
                owner_id: task.owner_id.clone(),
                entity_id: task.entity_id.clone(),
                error: reason,
            });
            return Ok(TaskStatus::Failed);
        }

        info!(
            "Task state change: PENDING -> RUNNING (task: {}, owner: {}, execution: {})",
            task.id, task.owner_id, execution.id
        );
        self.bus.publish(EngineEvent::TaskStarted {
            task_id: task.id,
            execution_id: execution.id,
            owner_id: task.owner_id.clone(),
            entity_id: task.entity_id.clone(),
        });
        if let Err(e) = self.rate_limiter.record_request().await {
            warn!("Failed to record request for task {}: {}", task.id, e);
        }

        // The executor runs inside the second phase when there are at least
        // two; earlier phases complete before it and later ones after it.
        let exec_phase = if execution.phases.len() >= 2 { 1 } else { 0 };
        for _ in 0..exec_phase {
            self.advance_phase(&mut execution);
        }
        if !execution.phases.is_empty() {
            let started = execution.start_next_phase(self.clock.now()).map(|_| ());
            if let Err(e) = started {
                debug!("Execution {}: {}", execution.id, e);
            }
        }
        self.store.save_execution_progress(&execution).await?;

        let result = self.execute_with_retry(&task, &mut execution, &cancel).await;

        if let Err(e) = self.rate_limiter.record_usage(result.tokens_used).await {
            warn!("Failed to record token usage for task {}: {}", task.id, e);
        }

        self.finish(&task, execution, result).await
    }

    fn advance_phase(&self, execution: &mut TaskExecution) {
        let now = self.clock.now();
        let started = execution.start_next_phase(now).map(|_| ());
        let advanced = match started {
            Ok(()) => execution.complete_active_phase(now),
            Err(e) => Err(e),
        };
        if let Err(e) = advanced {
            debug!("Execution {}: {}", execution.id, e);
        }
    }

    async fn execute_with_retry(
        &self,
        task: &QueuedTask,
        execution: &mut TaskExecution,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let options = ExecuteOptions {
            working_directory: task
                .payload
                .working_directory
                .clone()
                .or_else(|| self.config.working_directory.clone()),
            timeout: self.config.task_timeout,
            project_id: task.payload.project_id.clone(),
            agent_type: task.payload.agent_type.clone(),
        };
        let policy = &self.config.retry;
        let mut tokens_used = 0u64;
        let mut attempt = 0u32;

        let mut result = loop {
            attempt += 1;
            execution.attempts = attempt;
            // The executing phase reports the share of allowed attempts spent.
            let spent = (attempt - 1).saturating_mul(100) / policy.max_attempts.max(1);
            let progress = u8::try_from(spent).unwrap_or(100);
            if let Err(e) = execution.set_phase_progress(progress, self.clock.now()) {
                debug!("Execution {}: {}", execution.id, e);
            }
            execution.updated_at = self.clock.now();
            if let Err(e) = self.store.save_execution_progress(execution).await {
                warn!("Failed to save progress of execution {}: {}", execution.id, e);
            }

            let result = match tokio::time::timeout(
                self.config.task_timeout,
                self.executor
                    .execute(&task.payload.command, &options, cancel.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => ExecutionResult::failure(
                    ExecutionError::Timeout(self.config.task_timeout).to_string(),
                    self.config.task_timeout,
                ),
            };
            tokens_used = tokens_used.saturating_add(result.tokens_used);

            if result.success || cancel.is_cancelled() || !policy.should_retry(attempt) {
                break result;
            }

            let delay = policy.calculate_delay(attempt);
            warn!(
                "Task {} attempt {}/{} failed: {}; retrying in {:?}",
                task.id,
                attempt,
                policy.max_attempts,
                result.error.as_deref().unwrap_or("unknown error"),
                delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break result,
            }
        };

        result.tokens_used = tokens_used;
        execution.tokens_used = tokens_used;
        result
    }

    async fn finish(
        &self,
        task: &QueuedTask,
        mut execution: TaskExecution,
        result: ExecutionResult,
    ) -> Result<TaskStatus, StoreError> {
        let now = self.clock.now();

        if result.success {
            if let Err(e) = execution.complete_active_phase(now) {
                debug!("Execution {}: {}", execution.id, e);
            }
            let remaining = execution
                .phases
                .iter()
                .filter(|p| p.status == PhaseStatus::Pending)
                .count();
            for _ in 0..remaining {
                self.advance_phase(&mut execution);
            }
            self.store.save_execution_progress(&execution).await?;

            let completed = self
                .store
                .transition_task(
                    task.id,
                    &[TaskStatus::Running],
                    TaskUpdate::completed(now, result.output.clone()),
                )
                .await?;
            if completed.is_none() {
                return self.settle_superseded(task, &execution).await;
            }

            self.store
                .transition_execution(
                    execution.id,
                    &[ExecutionStatus::Running],
                    ExecutionStatus::Completed,
                    None,
                    now,
                )
                .await?;
            info!(
                "Task state change: RUNNING -> COMPLETED (task: {}, owner: {}, tokens: {}, duration: {:?})",
                task.id, task.owner_id, result.tokens_used, result.execution_time
            );
            self.bus.publish(EngineEvent::TaskCompleted {
                task_id: task.id,
                execution_id: execution.id,
                owner_id: task.owner_id.clone(),
                entity_id: task.entity_id.clone(),
                tokens_used: result.tokens_used,
            });
            return Ok(TaskStatus::Completed);
        }

        let error = result
            .error
            .clone()
            .unwrap_or_else(|| "agent command failed".to_string());
        execution.fail_active_phase(now);
        self.store.save_execution_progress(&execution).await?;

        let failed = self
            .store
            .transition_task(
                task.id,
                &[TaskStatus::Running],
                TaskUpdate::failed(now, error.clone()),
            )
            .await?;
        if failed.is_none() {
            return self.settle_superseded(task, &execution).await;
        }

        self.store
            .transition_execution(
                execution.id,
                &[ExecutionStatus::Running],
                ExecutionStatus::Failed,
                Some(error.clone()),
                now,
            )
            .await?;
        warn!(
            "Task state change: RUNNING -> FAILED (task: {}, owner: {}, attempts: {}, error: {})",
            task.id, task.owner_id, execution.attempts, error
        );
        self.bus.publish(EngineEvent::TaskFailed {
            task_id: task.id,
            execution_id: Some(execution.id),
            owner_id: task.owner_id.clone(),
            entity_id: task.entity_id.clone(),
            error,
        });
        Ok(TaskStatus::Failed)
    }

    /// The task left RUNNING while the executor ran (cancelled, or failed by
    /// recovery). Its state stands; only the execution is closed.
    async fn settle_superseded(
        &self,
        task: &QueuedTask,
        execution: &TaskExecution,
    ) -> Result<TaskStatus, StoreError> {
        let current = self
            .store
            .get_task(task.id)
            .await?
            .map(|t| t.status)
            .unwrap_or(TaskStatus::Cancelled);
        let reason = if current == TaskStatus::Cancelled {
            "cancelled".to_string()
        } else {
            format!("task moved to {} during execution", current)
        };
        self.store
            .transition_execution(
                execution.id,
                &[ExecutionStatus::Pending, ExecutionStatus::Running],
                ExecutionStatus::Failed,
                Some(reason),
                self.clock.now(),
            )
            .await?;
        info!(
            "Discarded executor result for task {}: task is already {}",
            task.id, current
        );
        Ok(current)
    }

    /// Wakes the processing loop after `delay`.
    fn schedule_wake(&self, delay: Duration) {
        let wake = Arc::clone(&self.wake);
        if delay.is_zero() {
            wake.notify_one();
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            wake.notify_one();
        });
    }

    pub fn state(&self) -> QueueState {
        self.control.lock().state
    }

    pub fn pause_reason(&self) -> Option<PauseReason> {
        self.control.lock().pause_reason
    }

    /// Applies a state change. Emits an event only when the state changes.
    fn transition_state(&self, to: QueueState, reason: Option<PauseReason>) -> bool {
        let from = {
            let mut control = self.control.lock();
            if control.state == to {
                // A manual pause takes over a rate-limit pause so auto-resume
                // leaves it alone.
                if reason == Some(PauseReason::Manual) {
                    control.pause_reason = reason;
                }
                return false;
            }
            let from = control.state;
            control.state = to;
            control.pause_reason = reason;
            from
        };

        let reason_str = reason.map(|r| r.as_str()).unwrap_or("resumed");
        info!("Queue state change: {} -> {} ({})", from, to, reason_str);
        self.bus.publish(EngineEvent::QueueStatusChanged {
            from,
            to,
            reason: reason_str.to_string(),
        });
        true
    }

    /// Stops dispatching. Returns whether the state changed.
    pub fn pause(&self) -> bool {
        self.transition_state(QueueState::Paused, Some(PauseReason::Manual))
    }

    /// Resumes dispatching and wakes the loop. Returns whether the state changed.
    pub fn resume(&self) -> bool {
        let changed = self.transition_state(QueueState::Active, None);
        if changed {
            self.wake.notify_one();
        }
        changed
    }

    /// Flips between ACTIVE and PAUSED and returns the new state.
    pub fn toggle(&self) -> QueueState {
        match self.state() {
            QueueState::Active => {
                self.pause();
            }
            QueueState::Paused => {
                self.resume();
            }
        }
        self.state()
    }

    /// Resumes a rate-limited queue once the budget allows another request.
    ///
    /// Manual pauses are never lifted here.
    pub async fn resume_if_rate_window_reset(&self) -> bool {
        if self.pause_reason() != Some(PauseReason::RateLimited) {
            return false;
        }
        match self.rate_limiter.can_proceed().await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!("Failed to read rate limit status: {}", e);
                return false;
            }
        }

        let resumed = {
            let control = self.control.lock();
            control.state == QueueState::Paused
                && control.pause_reason == Some(PauseReason::RateLimited)
        } && self.resume();
        if resumed {
            info!("Rate window reset; queue resumed automatically");
        }
        resumed
    }

    /// Arms a one-shot timer that resumes the queue at the next window
    /// boundary.
    fn arm_auto_resume(self: &Arc<Self>) {
        if !self.config.auto_resume || self.resume_armed.swap(true, Ordering::AcqRel) {
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if queue.pause_reason() != Some(PauseReason::RateLimited) {
                    break;
                }
                let wait = match queue.rate_limiter.time_until_reset().await {
                    Ok(Some(wait)) => wait,
                    Ok(None) => Duration::ZERO,
                    Err(e) => {
                        warn!("Failed to read rate window: {}", e);
                        queue.config.reschedule_delay
                    }
                };
                info!("Queue paused by rate limit; checking again in {:?}", wait);
                tokio::time::sleep(wait.max(MIN_RESUME_WAIT)).await;

                if queue.resume_if_rate_window_reset().await {
                    break;
                }
            }
            queue.resume_armed.store(false, Ordering::Release);
        });
    }

    /// Spawns the processing loop.
    ///
    /// The loop runs until a message arrives on `shutdown`; in-flight work is
    /// cancelled and allowed to record its result before the loop exits.
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            info!("Task queue processing loop started");
            loop {
                let process = queue.process_next_task();
                tokio::pin!(process);

                let outcome = tokio::select! {
                    outcome = &mut process => Some(outcome),
                    _ = shutdown.recv() => None,
                };
                let Some(outcome) = outcome else {
                    info!("Task queue shutdown requested");
                    queue.abort_in_flight();
                    process.await;
                    break;
                };

                if matches!(outcome, ProcessOutcome::RateLimited)
                    || (matches!(outcome, ProcessOutcome::Paused)
                        && queue.pause_reason() == Some(PauseReason::RateLimited))
                {
                    queue.arm_auto_resume();
                }

                tokio::select! {
                    _ = queue.wake.notified() => {}
                    _ = shutdown.recv() => {
                        info!("Task queue shutdown requested");
                        queue.abort_in_flight();
                        break;
                    }
                }
            }
            info!("Task queue processing loop stopped");
        })
    }

    /// Cancels a task that is not yet terminal.
    ///
    /// # Returns
    ///
    /// `true` if this call moved the task to CANCELLED, `false` if it was
    /// already terminal.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool, QueueError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(QueueError::TaskNotFound(task_id))?;
        if task.status.is_terminal() {
            return Ok(false);
        }

        let cancelled = self
            .store
            .transition_task(
                task_id,
                &[TaskStatus::Pending, TaskStatus::Running],
                TaskUpdate::cancelled(self.clock.now(), Some("cancelled by request".to_string())),
            )
            .await?;
        let Some(cancelled) = cancelled else {
            return Ok(false);
        };

        if let Some(token) = self.in_flight.lock().get(&task_id) {
            token.cancel();
        }
        info!(
            "Task state change: {} -> CANCELLED (task: {}, owner: {})",
            task.status, task_id, cancelled.owner_id
        );
        self.bus.publish(EngineEvent::TaskCancelled {
            task_id,
            owner_id: cancelled.owner_id,
            entity_id: cancelled.entity_id,
        });
        Ok(true)
    }

    /// Fires the cancellation token of every in-flight task.
    pub fn abort_in_flight(&self) -> usize {
        let in_flight = self.in_flight.lock();
        for token in in_flight.values() {
            token.cancel();
        }
        in_flight.len()
    }

    /// Fires the cancellation token of one in-flight task.
    pub fn abort_task(&self, task_id: Uuid) -> bool {
        match self.in_flight.lock().get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether this process is currently executing `task_id`.
    pub fn is_in_flight(&self, task_id: Uuid) -> bool {
        self.in_flight.lock().contains_key(&task_id)
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let (state, pause_reason) = {
            let control = self.control.lock();
            (control.state, control.pause_reason)
        };
        Ok(QueueStatus {
            state,
            pause_reason,
            pending: self.store.count_by_status(TaskStatus::Pending).await?,
            running: self.store.count_by_status(TaskStatus::Running).await?,
            rate: self.rate_limiter.get_status().await?,
        })
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<QueuedTask>, QueueError> {
        Ok(self.store.get_task(task_id).await?)
    }
}
