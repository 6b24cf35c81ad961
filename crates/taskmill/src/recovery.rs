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

//! # Recovery
//!
//! Drives work left behind by a previous process to a terminal state.
//!
//! Every non-terminal [`TaskExecution`] found in the store is classified:
//!
//! - **settled**: its task is already terminal (completed, failed or
//!   cancelled); only the execution record is closed.
//! - **active**: the task is running in this process; left alone.
//! - **stale**: older than the staleness threshold; the execution and task
//!   are failed as interrupted and the failure cascades to the entity.
//! - **resumable**: everything else; the old execution and task are failed
//!   as interrupted and a fresh copy of the task is enqueued.
//!
//! A RUNNING task with no open execution was claimed but never started
//! (the process died in between); it is failed as interrupted.
//!
//! Entities stuck INITIALIZING with no execution and no queued task are
//! orphans; the [`ArtifactProbe`] decides whether they are promoted or
//! failed. Every action is written to the store as a [`RecoveryEvent`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::RecoveryConfig;
use crate::error::{ProbeError, QueueError, RecoveryError, StaleTaskError, StoreError};
use crate::events::{EngineEvent, EventBus};
use crate::models::{
    Entity, EntityStatus, ExecutionStatus, RecoveryEvent, RecoveryType, TaskExecution, TaskStatus,
    TaskUpdate,
};
use crate::queue::TaskQueue;
use crate::store::Store;

const NON_TERMINAL_EXECUTION: [ExecutionStatus; 2] =
    [ExecutionStatus::Pending, ExecutionStatus::Running];
const NON_TERMINAL_TASK: [TaskStatus; 2] = [TaskStatus::Pending, TaskStatus::Running];

/// Answers whether an entity's expected artifact exists and removes it.
#[async_trait]
pub trait ArtifactProbe: Send + Sync {
    async fn artifact_exists(&self, entity: &Entity) -> Result<bool, ProbeError>;

    /// Removes whatever the entity left behind; returns how many artifacts
    /// were removed.
    async fn remove_artifacts(&self, entity: &Entity) -> Result<usize, ProbeError>;
}

/// Looks for artifacts at `<root>/<entity id>`.
#[derive(Debug, Clone)]
pub struct FsArtifactProbe {
    root: PathBuf,
}

impl FsArtifactProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, entity: &Entity) -> Result<PathBuf, ProbeError> {
        let relative = Path::new(&entity.id);
        let mut components = relative.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(relative)),
            _ => Err(ProbeError(format!(
                "entity id '{}' is not a plain path segment",
                entity.id
            ))),
        }
    }
}

#[async_trait]
impl ArtifactProbe for FsArtifactProbe {
    async fn artifact_exists(&self, entity: &Entity) -> Result<bool, ProbeError> {
        let path = self.path_for(entity)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| ProbeError(format!("{}: {}", path.display(), e)))
    }

    async fn remove_artifacts(&self, entity: &Entity) -> Result<usize, ProbeError> {
        let path = self.path_for(entity)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(ProbeError(format!("{}: {}", path.display(), e))),
        };
        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(|e| ProbeError(format!("{}: {}", path.display(), e)))?;
        debug!("Removed artifacts at {}", path.display());
        Ok(1)
    }
}

/// Probe for hosts that produce no artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoArtifacts;

#[async_trait]
impl ArtifactProbe for NoArtifacts {
    async fn artifact_exists(&self, _entity: &Entity) -> Result<bool, ProbeError> {
        Ok(false)
    }

    async fn remove_artifacts(&self, _entity: &Entity) -> Result<usize, ProbeError> {
        Ok(0)
    }
}

/// Counts from one recovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Executions and entities examined.
    pub candidates: usize,
    pub stale_failed: usize,
    /// RUNNING tasks that never got an execution record.
    pub unstarted_failed: usize,
    pub resubmitted: usize,
    pub settled: usize,
    pub active: usize,
    pub orphans_promoted: usize,
    pub orphans_failed: usize,
    pub errors: Vec<String>,
}

impl RecoveryReport {
    /// Records that changed state.
    pub fn recovered(&self) -> usize {
        self.stale_failed
            + self.unstarted_failed
            + self.resubmitted
            + self.settled
            + self.orphans_promoted
            + self.orphans_failed
    }
}

/// Outcome of [`RecoveryService::cleanup_cancelled`]. Steps that failed are
/// listed in `errors`; the others still ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub task_cancelled: bool,
    pub executions_failed: usize,
    pub artifacts_removed: usize,
    pub entity_archived: bool,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct RecoveryService {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    queue: Arc<TaskQueue>,
    probe: Arc<dyn ArtifactProbe>,
    config: RecoveryConfig,
}

impl std::fmt::Debug for RecoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryService")
            .field("config", &self.config)
            .finish()
    }
}

impl RecoveryService {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        queue: Arc<TaskQueue>,
        probe: Arc<dyn ArtifactProbe>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            queue,
            probe,
            config,
        }
    }

    fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::minutes(30))
    }

    /// Startup sweep over every non-terminal execution and every
    /// initializing entity.
    pub async fn recover_interrupted_tasks(&self) -> Result<RecoveryReport, RecoveryError> {
        let now = self.clock.now();
        let mut report = RecoveryReport::default();

        let executions = self.store.list_non_terminal_executions(None).await?;
        info!(
            "Recovery sweep: {} non-terminal execution(s) found",
            executions.len()
        );
        for execution in executions {
            report.candidates += 1;
            if let Err(e) = self.recover_execution(&execution, now, &mut report).await {
                warn!("Failed to recover execution {}: {}", execution.id, e);
                report
                    .errors
                    .push(format!("execution {}: {}", execution.id, e));
            }
        }

        self.recover_unstarted(None, now, &mut report).await?;
        self.recover_orphans(None, now, &mut report).await?;

        info!(
            "Recovery sweep finished: {} stale, {} unstarted, {} resubmitted, {} settled, {} active, {} orphan(s) promoted, {} orphan(s) failed",
            report.stale_failed,
            report.unstarted_failed,
            report.resubmitted,
            report.settled,
            report.active,
            report.orphans_promoted,
            report.orphans_failed
        );
        Ok(report)
    }

    /// Periodic sweep limited to records created more than `max_age_hours`
    /// ago. Non-terminal executions that old are failed as stale unless this
    /// process is running them. So are RUNNING tasks claimed that long ago
    /// without an execution. Initializing entities that old are treated as
    /// orphans.
    ///
    /// Running it twice in a row finds nothing the second time.
    pub async fn cleanup_orphaned(&self, max_age_hours: u32) -> Result<RecoveryReport, RecoveryError> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::hours(i64::from(max_age_hours));
        let mut report = RecoveryReport::default();

        for execution in self.store.list_non_terminal_executions(Some(cutoff)).await? {
            if self.queue.is_in_flight(execution.task_id) {
                report.active += 1;
                continue;
            }
            report.candidates += 1;
            let result = match self.store.get_task(execution.task_id).await {
                Ok(Some(task)) if task.status.is_terminal() => {
                    self.settle(&execution, task.status, now, &mut report).await
                }
                Ok(_) => self.fail_stale(&execution, now, &mut report).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                report
                    .errors
                    .push(format!("execution {}: {}", execution.id, e));
            }
        }

        self.recover_unstarted(Some(cutoff), now, &mut report).await?;
        self.recover_orphans(Some(cutoff), now, &mut report).await?;

        if report.candidates > 0 {
            info!(
                "Orphan cleanup: {} candidate(s), {} recovered",
                report.candidates,
                report.recovered()
            );
        } else {
            debug!("Orphan cleanup: nothing older than {}h", max_age_hours);
        }
        Ok(report)
    }

    /// Cancels a task and cleans up after it: fails its open executions,
    /// removes the entity's artifacts and archives the entity.
    ///
    /// Never returns an error; failed steps are listed on the report.
    pub async fn cleanup_cancelled(&self, entity_id: &str, task_id: Uuid, reason: &str) -> CleanupReport {
        let now = self.clock.now();
        let mut report = CleanupReport::default();

        match self
            .store
            .transition_task(
                task_id,
                &NON_TERMINAL_TASK,
                TaskUpdate::cancelled(now, Some(reason.to_string())),
            )
            .await
        {
            Ok(Some(task)) => {
                report.task_cancelled = true;
                self.queue.abort_task(task_id);
                info!("Task {} cancelled during cleanup: {}", task_id, reason);
                self.bus.publish(EngineEvent::TaskCancelled {
                    task_id,
                    owner_id: task.owner_id,
                    entity_id: task.entity_id,
                });
            }
            Ok(None) => debug!("Task {} already terminal, not cancelled", task_id),
            Err(e) => report.errors.push(format!("cancel task {}: {}", task_id, e)),
        }

        match self.store.executions_for_task(task_id).await {
            Ok(executions) => {
                for execution in executions.iter().filter(|e| !e.status.is_terminal()) {
                    match self
                        .store
                        .transition_execution(
                            execution.id,
                            &NON_TERMINAL_EXECUTION,
                            ExecutionStatus::Failed,
                            Some(format!("cancelled: {}", reason)),
                            now,
                        )
                        .await
                    {
                        Ok(Some(_)) => report.executions_failed += 1,
                        Ok(None) => {}
                        Err(e) => report
                            .errors
                            .push(format!("fail execution {}: {}", execution.id, e)),
                    }
                }
            }
            Err(e) => report
                .errors
                .push(format!("list executions of task {}: {}", task_id, e)),
        }

        match self.store.get_entity(entity_id).await {
            Ok(Some(entity)) => {
                match self.probe.remove_artifacts(&entity).await {
                    Ok(removed) => report.artifacts_removed = removed,
                    Err(e) => report.errors.push(e.to_string()),
                }
                match self
                    .store
                    .transition_entity(
                        entity_id,
                        &[
                            EntityStatus::Initializing,
                            EntityStatus::Active,
                            EntityStatus::Completed,
                            EntityStatus::Failed,
                        ],
                        EntityStatus::Archived,
                        Some(reason.to_string()),
                        now,
                    )
                    .await
                {
                    Ok(archived) => report.entity_archived = archived.is_some(),
                    Err(e) => report
                        .errors
                        .push(format!("archive entity {}: {}", entity_id, e)),
                }
            }
            Ok(None) => debug!("Entity {} not found during cleanup", entity_id),
            Err(e) => report
                .errors
                .push(format!("load entity {}: {}", entity_id, e)),
        }

        self.record(
            RecoveryEvent::new(
                RecoveryType::CancelledCleanup,
                format!(
                    "{} ({} execution(s) failed, {} artifact(s) removed, {} error(s))",
                    reason,
                    report.executions_failed,
                    report.artifacts_removed,
                    report.errors.len()
                ),
                now,
            )
            .task(task_id)
            .entity(entity_id),
        )
        .await;

        if !report.is_clean() {
            warn!(
                "Cleanup of cancelled task {} finished with {} error(s)",
                task_id,
                report.errors.len()
            );
        }
        report
    }

    /// Runs [`cleanup_orphaned`](Self::cleanup_orphaned) every
    /// `sweep_interval` until `shutdown` fires.
    pub fn spawn_periodic(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.config.sweep_interval);
            // The first tick completes immediately; startup recovery covers it.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = service.cleanup_orphaned(service.config.orphan_max_age_hours).await {
                            error!("Periodic recovery sweep failed: {}", e);
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Periodic recovery stopped");
                        break;
                    }
                }
            }
        })
    }

    async fn recover_execution(
        &self,
        execution: &TaskExecution,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> Result<(), StoreError> {
        let task = match self.store.get_task(execution.task_id).await? {
            Some(task) => task,
            None => {
                warn!(
                    "Execution {} references missing task {}",
                    execution.id, execution.task_id
                );
                return self
                    .settle(execution, TaskStatus::Failed, now, report)
                    .await;
            }
        };

        if task.status.is_terminal() {
            return self.settle(execution, task.status, now, report).await;
        }

        if self.queue.is_in_flight(task.id) {
            debug!("Task {} is running in this process; skipping", task.id);
            report.active += 1;
            return Ok(());
        }

        if execution.age(now) > self.stale_threshold() {
            return self.fail_stale(execution, now, report).await;
        }

        let reason = "interrupted: resubmitted after restart";
        self.store
            .transition_execution(
                execution.id,
                &NON_TERMINAL_EXECUTION,
                ExecutionStatus::Failed,
                Some(reason.to_string()),
                now,
            )
            .await?;
        let Some(failed) = self
            .store
            .transition_task(task.id, &NON_TERMINAL_TASK, TaskUpdate::failed(now, reason))
            .await?
        else {
            return Ok(());
        };
        info!(
            "Task state change: {} -> FAILED (task: {}, reason: {})",
            task.status, task.id, reason
        );

        match self.queue.enqueue(failed.to_new_task()).await {
            Ok(resubmitted) => {
                report.resubmitted += 1;
                self.record(
                    RecoveryEvent::new(
                        RecoveryType::TaskResubmitted,
                        format!("resubmitted as task {}", resubmitted.id),
                        now,
                    )
                    .task(task.id)
                    .execution(execution.id)
                    .entity(&execution.entity_id),
                )
                .await;
            }
            Err(QueueError::Admission(e)) => {
                warn!("Resubmission of task {} refused: {}", task.id, e);
                report.settled += 1;
                self.record(
                    RecoveryEvent::new(
                        RecoveryType::ExecutionSettled,
                        format!("resubmission refused: {}", e),
                        now,
                    )
                    .task(task.id)
                    .execution(execution.id)
                    .entity(&execution.entity_id),
                )
                .await;
            }
            Err(e) => {
                report
                    .errors
                    .push(format!("resubmit task {}: {}", task.id, e));
            }
        }
        Ok(())
    }

    async fn settle(
        &self,
        execution: &TaskExecution,
        task_status: TaskStatus,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> Result<(), StoreError> {
        let reason = format!("task already {}", task_status);
        if self
            .store
            .transition_execution(
                execution.id,
                &NON_TERMINAL_EXECUTION,
                ExecutionStatus::Failed,
                Some(reason.clone()),
                now,
            )
            .await?
            .is_some()
        {
            report.settled += 1;
            self.record(
                RecoveryEvent::new(RecoveryType::ExecutionSettled, reason, now)
                    .task(execution.task_id)
                    .execution(execution.id)
                    .entity(&execution.entity_id),
            )
            .await;
        }
        Ok(())
    }

    async fn fail_stale(
        &self,
        execution: &TaskExecution,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> Result<(), StoreError> {
        let stale = StaleTaskError {
            execution_id: execution.id,
            task_id: execution.task_id,
            age_minutes: execution.age(now).num_minutes(),
        };
        let reason = stale.to_string();
        warn!("{}", reason);

        self.store
            .transition_execution(
                execution.id,
                &NON_TERMINAL_EXECUTION,
                ExecutionStatus::Failed,
                Some(reason.clone()),
                now,
            )
            .await?;
        self.fail_task(execution.task_id, Some(execution.id), &reason, now)
            .await?;
        if self
            .store
            .transition_entity(
                &execution.entity_id,
                &[EntityStatus::Initializing, EntityStatus::Active],
                EntityStatus::Failed,
                Some(reason.clone()),
                now,
            )
            .await?
            .is_some()
        {
            info!("Entity {} marked FAILED", execution.entity_id);
        }

        report.stale_failed += 1;
        self.record(
            RecoveryEvent::new(RecoveryType::StaleExecutionFailed, reason, now)
                .task(execution.task_id)
                .execution(execution.id)
                .entity(&execution.entity_id),
        )
        .await;
        Ok(())
    }

    /// Fails a RUNNING task as interrupted. A task still PENDING cannot fail,
    /// so it is cancelled with the same reason instead.
    async fn fail_task(
        &self,
        task_id: Uuid,
        execution_id: Option<Uuid>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if let Some(task) = self
            .store
            .transition_task(
                task_id,
                &[TaskStatus::Running],
                TaskUpdate::failed(now, reason),
            )
            .await?
        {
            info!(
                "Task state change: RUNNING -> FAILED (task: {}, reason: {})",
                task.id, reason
            );
            self.bus.publish(EngineEvent::TaskFailed {
                task_id: task.id,
                execution_id,
                owner_id: task.owner_id,
                entity_id: task.entity_id,
                error: reason.to_string(),
            });
            return Ok(true);
        }

        if let Some(task) = self
            .store
            .transition_task(
                task_id,
                &[TaskStatus::Pending],
                TaskUpdate::cancelled(now, Some(reason.to_string())),
            )
            .await?
        {
            info!(
                "Task state change: PENDING -> CANCELLED (task: {}, reason: {})",
                task.id, reason
            );
            self.bus.publish(EngineEvent::TaskCancelled {
                task_id: task.id,
                owner_id: task.owner_id,
                entity_id: task.entity_id,
            });
        }
        Ok(false)
    }

    async fn recover_unstarted(
        &self,
        started_before: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> Result<(), RecoveryError> {
        for task in self.store.list_tasks_by_status(TaskStatus::Running).await? {
            if self.queue.is_in_flight(task.id) {
                continue;
            }
            let claimed_at = task.started_at.unwrap_or(task.created_at);
            if started_before.is_some_and(|cutoff| claimed_at >= cutoff) {
                continue;
            }
            let executions = self.store.executions_for_task(task.id).await?;
            if executions.iter().any(|e| !e.status.is_terminal()) {
                continue;
            }
            report.candidates += 1;

            let reason = "interrupted: task was claimed but never started";
            warn!("Task {} is RUNNING with no open execution", task.id);
            if !self.fail_task(task.id, None, reason, now).await? {
                continue;
            }
            if self
                .store
                .transition_entity(
                    &task.entity_id,
                    &[EntityStatus::Initializing, EntityStatus::Active],
                    EntityStatus::Failed,
                    Some(reason.to_string()),
                    now,
                )
                .await?
                .is_some()
            {
                info!("Entity {} marked FAILED", task.entity_id);
            }

            report.unstarted_failed += 1;
            self.record(
                RecoveryEvent::new(RecoveryType::UnstartedTaskFailed, reason, now)
                    .task(task.id)
                    .entity(&task.entity_id),
            )
            .await;
        }
        Ok(())
    }

    async fn recover_orphans(
        &self,
        created_before: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> Result<(), RecoveryError> {
        let entities = self
            .store
            .list_entities_by_status(EntityStatus::Initializing, created_before)
            .await?;
        if entities.is_empty() {
            return Ok(());
        }

        // Entities with queued or running work are waiting, not orphaned.
        let mut waiting = HashSet::new();
        for status in NON_TERMINAL_TASK {
            for task in self.store.list_tasks_by_status(status).await? {
                waiting.insert(task.entity_id);
            }
        }

        for entity in entities {
            if waiting.contains(&entity.id)
                || !self.store.executions_for_entity(&entity.id).await?.is_empty()
            {
                continue;
            }
            report.candidates += 1;

            let exists = match self.probe.artifact_exists(&entity).await {
                Ok(exists) => exists,
                Err(e) => {
                    warn!("Artifact probe failed for entity {}: {}", entity.id, e);
                    report.errors.push(format!("entity {}: {}", entity.id, e));
                    continue;
                }
            };

            let (to, kind, reason) = if exists {
                (
                    EntityStatus::Active,
                    RecoveryType::OrphanPromoted,
                    None,
                )
            } else {
                (
                    EntityStatus::Failed,
                    RecoveryType::OrphanFailed,
                    Some("orphaned: no execution record and no artifact".to_string()),
                )
            };
            if self
                .store
                .transition_entity(&entity.id, &[EntityStatus::Initializing], to, reason, now)
                .await?
                .is_none()
            {
                continue;
            }

            info!("Orphaned entity {}: INITIALIZING -> {}", entity.id, to);
            if exists {
                report.orphans_promoted += 1;
            } else {
                report.orphans_failed += 1;
            }
            self.record(
                RecoveryEvent::new(kind, format!("entity moved to {}", to), now).entity(&entity.id),
            )
            .await;
        }
        Ok(())
    }

    async fn record(&self, event: RecoveryEvent) {
        debug!("Recovery event: {} {}", event.kind.as_str(), event.details);
        if let Err(e) = self.store.record_recovery_event(event).await {
            warn!("Failed to record recovery event: {}", e);
        }
    }
}
