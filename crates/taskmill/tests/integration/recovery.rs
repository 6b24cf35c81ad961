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

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use taskmill::models::{ExecutionStatus, RecoveryType};
use taskmill::store::{EntityStore, ExecutionStore, RecoveryEventStore, TaskStore};
use taskmill::{
    Clock, Entity, EngineEvent, EntityStatus, FsArtifactProbe, NoArtifacts, ProcessOutcome,
    QueuedTask, TaskExecution, TaskStatus,
};
use tempfile::TempDir;
use tracing_test::traced_test;

use crate::fixtures::{drain, start_time, task, wait_for, Harness};

/// Seeds a task left RUNNING by a previous process, with its open
/// execution and an INITIALIZING entity.
async fn seed_interrupted(
    harness: &Harness,
    entity_id: &str,
    at: DateTime<Utc>,
) -> (QueuedTask, TaskExecution) {
    let mut queued = QueuedTask::from_new(task("alice", "build").with_entity(entity_id), 5, at);
    queued.status = TaskStatus::Running;
    queued.started_at = Some(at);
    harness.store.insert_task(queued.clone()).await.unwrap();

    let execution = TaskExecution::start(queued.id, entity_id, &harness.config.queue.phases, at);
    harness
        .store
        .insert_execution(execution.clone())
        .await
        .unwrap();
    harness
        .store
        .upsert_entity(Entity::new(entity_id, EntityStatus::Initializing, at))
        .await
        .unwrap();
    (queued, execution)
}

/// Seeds a task claimed by a previous process that died before it recorded
/// an execution.
async fn seed_claimed(harness: &Harness, entity_id: &str, at: DateTime<Utc>) -> QueuedTask {
    let mut queued = QueuedTask::from_new(task("alice", "build").with_entity(entity_id), 5, at);
    queued.status = TaskStatus::Running;
    queued.started_at = Some(at);
    harness.store.insert_task(queued.clone()).await.unwrap();
    seed_entity(harness, entity_id, at).await;
    queued
}

async fn seed_entity(harness: &Harness, entity_id: &str, at: DateTime<Utc>) {
    harness
        .store
        .upsert_entity(Entity::new(entity_id, EntityStatus::Initializing, at))
        .await
        .unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_stale_execution_is_failed_and_cascades() {
    let harness = Harness::new();
    let (queued, execution) = seed_interrupted(&harness, "proj-1", start_time()).await;
    harness.clock.advance(ChronoDuration::minutes(45));
    let mut events = harness.subscribe();

    let report = harness
        .recovery(Arc::new(NoArtifacts))
        .recover_interrupted_tasks()
        .await
        .unwrap();

    assert_eq!(report.candidates, 1);
    assert_eq!(report.stale_failed, 1);
    assert_eq!(report.resubmitted, 0);

    let execution = harness.store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.as_deref().unwrap().contains("interrupted"));

    let task = harness.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap().contains("45 minute(s)"));

    let entity = harness.store.get_entity("proj-1").await.unwrap().unwrap();
    assert_eq!(entity.status, EntityStatus::Failed);

    let recorded = harness.store.list_recovery_events().await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].kind, RecoveryType::StaleExecutionFailed);
    assert_eq!(recorded[0].task_id, Some(queued.id));

    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, EngineEvent::TaskFailed { task_id, .. } if *task_id == queued.id)));
    assert!(harness
        .store
        .list_tasks_by_status(TaskStatus::Pending)
        .await
        .unwrap()
        .is_empty());
    assert!(logs_contain("-> FAILED"));
}

#[tokio::test]
async fn test_recent_interruption_is_resubmitted() {
    let harness = Harness::new();
    let (queued, execution) = seed_interrupted(&harness, "proj-2", start_time()).await;
    harness.clock.advance(ChronoDuration::minutes(10));

    let report = harness
        .recovery(Arc::new(NoArtifacts))
        .recover_interrupted_tasks()
        .await
        .unwrap();
    assert_eq!(report.resubmitted, 1);
    assert_eq!(report.stale_failed, 0);
    assert_eq!(report.recovered(), 1);

    let old_execution = harness.store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(old_execution.status, ExecutionStatus::Failed);
    let old_task = harness.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(old_task.status, TaskStatus::Failed);

    let pending = harness
        .store
        .list_tasks_by_status(TaskStatus::Pending)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_ne!(pending[0].id, queued.id);
    assert_eq!(pending[0].entity_id, "proj-2");
    assert_eq!(pending[0].payload, queued.payload);

    // The entity has work again; it stays INITIALIZING.
    let entity = harness.store.get_entity("proj-2").await.unwrap().unwrap();
    assert_eq!(entity.status, EntityStatus::Initializing);

    let kinds: Vec<RecoveryType> = harness
        .store
        .list_recovery_events()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![RecoveryType::TaskResubmitted]);

    // The resubmitted copy runs normally.
    let outcome = harness.queue.process_next_task().await;
    assert!(matches!(
        outcome,
        ProcessOutcome::Processed {
            status: TaskStatus::Completed,
            ..
        }
    ));
}

#[tokio::test]
async fn test_stale_execution_of_pending_task_cancels_it() {
    let harness = Harness::new();
    let queued = QueuedTask::from_new(task("alice", "build").with_entity("proj-4"), 5, start_time());
    harness.store.insert_task(queued.clone()).await.unwrap();
    let execution =
        TaskExecution::start(queued.id, "proj-4", &harness.config.queue.phases, start_time());
    harness
        .store
        .insert_execution(execution.clone())
        .await
        .unwrap();
    seed_entity(&harness, "proj-4", start_time()).await;
    harness.clock.advance(ChronoDuration::minutes(45));

    let report = harness
        .recovery(Arc::new(NoArtifacts))
        .recover_interrupted_tasks()
        .await
        .unwrap();
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.stale_failed, 1);

    let execution = harness.store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    let task = harness.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    let entity = harness.store.get_entity("proj-4").await.unwrap().unwrap();
    assert_eq!(entity.status, EntityStatus::Failed);

    let kinds: Vec<_> = harness
        .store
        .list_recovery_events()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![RecoveryType::StaleExecutionFailed]);
}

#[tokio::test]
async fn test_claimed_task_without_execution_is_failed() {
    let harness = Harness::new();
    let queued = seed_claimed(&harness, "proj-5", start_time()).await;
    harness.clock.advance(ChronoDuration::hours(48));
    let mut events = harness.subscribe();

    let recovery = harness.recovery(Arc::new(NoArtifacts));
    let report = recovery.recover_interrupted_tasks().await.unwrap();
    assert_eq!(report.unstarted_failed, 1);
    assert_eq!(report.orphans_failed, 0);
    assert_eq!(report.recovered(), 1);

    let task = harness.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap().contains("interrupted"));
    let entity = harness.store.get_entity("proj-5").await.unwrap().unwrap();
    assert_eq!(entity.status, EntityStatus::Failed);

    let recorded = harness.store.list_recovery_events().await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].kind, RecoveryType::UnstartedTaskFailed);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        EngineEvent::TaskFailed { task_id, execution_id: None, .. } if *task_id == queued.id
    )));

    let again = recovery.cleanup_orphaned(1).await.unwrap();
    assert_eq!(again.recovered(), 0);
    // The failed task no longer holds one of alice's admission slots.
    assert_eq!(harness.queue.can_enqueue("alice").await.unwrap().current_size, 0);
}

#[tokio::test]
async fn test_cleanup_fails_only_old_claimed_tasks() {
    let harness = Harness::new();
    let old = seed_claimed(&harness, "old-claim", start_time()).await;
    harness.clock.advance(ChronoDuration::hours(2));
    let recent = seed_claimed(&harness, "new-claim", harness.clock.now()).await;

    let report = harness
        .recovery(Arc::new(NoArtifacts))
        .cleanup_orphaned(1)
        .await
        .unwrap();
    assert_eq!(report.unstarted_failed, 1);
    assert_eq!(report.orphans_failed, 0);

    let old = harness.store.get_task(old.id).await.unwrap().unwrap();
    assert_eq!(old.status, TaskStatus::Failed);
    let recent = harness.store.get_task(recent.id).await.unwrap().unwrap();
    assert_eq!(recent.status, TaskStatus::Running);
    let entity = harness.store.get_entity("new-claim").await.unwrap().unwrap();
    assert_eq!(entity.status, EntityStatus::Initializing);
}

#[tokio::test]
async fn test_execution_of_finished_task_is_settled() {
    let harness = Harness::new();
    let (queued, execution) = seed_interrupted(&harness, "proj-3", start_time()).await;
    harness
        .store
        .transition_task(
            queued.id,
            &[TaskStatus::Running],
            taskmill::models::TaskUpdate::completed(start_time(), Some("done".to_string())),
        )
        .await
        .unwrap()
        .unwrap();

    let report = harness
        .recovery(Arc::new(NoArtifacts))
        .recover_interrupted_tasks()
        .await
        .unwrap();
    assert_eq!(report.settled, 1);

    let execution = harness.store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_deref(), Some("task already COMPLETED"));
    let task = harness.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_cancelled_task_is_never_reprocessed() {
    let harness = Harness::new();
    let queued = harness.queue.enqueue(task("alice", "build")).await.unwrap();
    assert!(harness.queue.cancel_task(queued.id).await.unwrap());

    assert_eq!(harness.queue.process_next_task().await, ProcessOutcome::Idle);

    let report = harness
        .recovery(Arc::new(NoArtifacts))
        .recover_interrupted_tasks()
        .await
        .unwrap();
    assert_eq!(report.candidates, 0);
    assert_eq!(harness.queue.process_next_task().await, ProcessOutcome::Idle);

    let task = harness.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(harness.executor.calls().is_empty());
}

#[tokio::test]
async fn test_orphaned_entities_are_resolved_by_artifacts() {
    let harness = Harness::new();
    let artifacts = TempDir::new().unwrap();
    tokio::fs::create_dir(artifacts.path().join("built"))
        .await
        .unwrap();

    seed_entity(&harness, "built", start_time()).await;
    seed_entity(&harness, "ghost", start_time()).await;
    seed_entity(&harness, "waiting", start_time()).await;
    harness
        .queue
        .enqueue(task("alice", "build").with_entity("waiting"))
        .await
        .unwrap();

    let report = harness
        .recovery(Arc::new(FsArtifactProbe::new(artifacts.path())))
        .recover_interrupted_tasks()
        .await
        .unwrap();
    assert_eq!(report.orphans_promoted, 1);
    assert_eq!(report.orphans_failed, 1);
    assert!(report.errors.is_empty());

    let status = |id: &'static str| {
        let store = harness.store.clone();
        async move { store.get_entity(id).await.unwrap().unwrap().status }
    };
    assert_eq!(status("built").await, EntityStatus::Active);
    assert_eq!(status("ghost").await, EntityStatus::Failed);
    assert_eq!(status("waiting").await, EntityStatus::Initializing);
}

#[tokio::test]
async fn test_cleanup_orphaned_is_idempotent() {
    let harness = Harness::new();
    seed_interrupted(&harness, "old-proj", start_time()).await;
    seed_entity(&harness, "old-orphan", start_time()).await;
    harness.clock.advance(ChronoDuration::hours(2));
    seed_entity(&harness, "fresh", harness.clock.now()).await;

    let recovery = harness.recovery(Arc::new(NoArtifacts));
    let first = recovery.cleanup_orphaned(1).await.unwrap();
    assert_eq!(first.candidates, 2);
    assert_eq!(first.stale_failed, 1);
    assert_eq!(first.orphans_failed, 1);

    let second = recovery.cleanup_orphaned(1).await.unwrap();
    assert_eq!(second.candidates, 0);
    assert_eq!(second.recovered(), 0);

    let fresh = harness.store.get_entity("fresh").await.unwrap().unwrap();
    assert_eq!(fresh.status, EntityStatus::Initializing);
}

#[tokio::test]
async fn test_cleanup_cancelled_removes_everything() {
    let harness = Harness::new();
    let artifacts = TempDir::new().unwrap();
    let entity_dir = artifacts.path().join("proj-9");
    tokio::fs::create_dir(&entity_dir).await.unwrap();
    tokio::fs::write(entity_dir.join("README.md"), b"draft")
        .await
        .unwrap();

    let (queued, execution) = seed_interrupted(&harness, "proj-9", start_time()).await;
    let mut events = harness.subscribe();

    let report = harness
        .recovery(Arc::new(FsArtifactProbe::new(artifacts.path())))
        .cleanup_cancelled("proj-9", queued.id, "user cancelled")
        .await;

    assert!(report.is_clean());
    assert!(report.task_cancelled);
    assert_eq!(report.executions_failed, 1);
    assert_eq!(report.artifacts_removed, 1);
    assert!(report.entity_archived);
    assert!(!entity_dir.exists());

    let task = harness.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    let execution = harness.store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(execution.error.as_deref(), Some("cancelled: user cancelled"));
    let entity = harness.store.get_entity("proj-9").await.unwrap().unwrap();
    assert_eq!(entity.status, EntityStatus::Archived);

    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, EngineEvent::TaskCancelled { .. })));

    // A second cleanup finds nothing left to do.
    let again = harness
        .recovery(Arc::new(FsArtifactProbe::new(artifacts.path())))
        .cleanup_cancelled("proj-9", queued.id, "user cancelled")
        .await;
    assert!(!again.task_cancelled);
    assert_eq!(again.executions_failed, 0);
    assert_eq!(again.artifacts_removed, 0);
}

#[tokio::test]
async fn test_in_flight_tasks_are_left_alone() {
    let harness = Harness::new();
    let queued = harness
        .queue
        .enqueue(task("alice", "sleep:300"))
        .await
        .unwrap();

    let queue = Arc::clone(&harness.queue);
    let worker = tokio::spawn(async move { queue.process_next_task().await });
    assert!(wait_for(Duration::from_secs(2), || {
        let store = harness.store.clone();
        async move { !store.executions_for_task(queued.id).await.unwrap().is_empty() }
    })
    .await);
    assert!(harness.queue.is_in_flight(queued.id));

    harness.clock.advance(ChronoDuration::hours(3));
    let report = harness
        .recovery(Arc::new(NoArtifacts))
        .recover_interrupted_tasks()
        .await
        .unwrap();
    assert_eq!(report.active, 1);
    assert_eq!(report.recovered(), 0);

    let outcome = worker.await.unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::Processed {
            status: TaskStatus::Completed,
            ..
        }
    ));
}
