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

use std::sync::Arc;
use std::time::Duration;
use taskmill::models::{ExecutionStatus, PhaseStatus};
use taskmill::store::{ExecutionStore, TaskStore};
use taskmill::{
    EngineConfig, EngineEvent, Priority, ProcessOutcome, QueueError, QueueState, RetryPolicy,
    TaskStatus,
};
use tokio::sync::broadcast;
use tracing_test::traced_test;

use crate::fixtures::{drain, task, wait_for, Harness, ScriptedExecutor};

#[tokio::test]
async fn test_admission_limit_rejects_third_task() {
    let mut config = EngineConfig::default();
    config.owners.default_max_queue_size = 2;
    let harness = Harness::with_config(config);

    harness.queue.enqueue(task("alice", "one")).await.unwrap();
    harness.queue.enqueue(task("alice", "two")).await.unwrap();
    let third = harness.queue.enqueue(task("alice", "three")).await;

    match third {
        Err(QueueError::Admission(e)) => {
            assert_eq!(e.current_size, 2);
            assert_eq!(e.max_size, 2);
        }
        other => panic!("expected admission error, got {:?}", other),
    }
    assert_eq!(harness.store.count_active_for_owner("alice").await.unwrap(), 2);

    // Other owners have their own budget.
    assert!(harness.queue.enqueue(task("bob", "one")).await.is_ok());
    let admission = harness.queue.can_enqueue("alice").await.unwrap();
    assert!(!admission.allowed);
    assert!(admission.reason.is_some());
}

#[tokio::test]
async fn test_concurrent_enqueues_never_overshoot_limit() {
    let mut config = EngineConfig::default();
    config.owners.default_max_queue_size = 3;
    let harness = Harness::with_config(config);

    let attempts = (0..10).map(|i| {
        let queue = Arc::clone(&harness.queue);
        tokio::spawn(async move { queue.enqueue(task("alice", &format!("cmd-{}", i))).await })
    });
    let results = futures::future::join_all(attempts).await;
    let accepted = results
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();

    assert_eq!(accepted, 3);
    assert_eq!(harness.store.count_active_for_owner("alice").await.unwrap(), 3);
}

#[tokio::test]
async fn test_dequeue_order_is_priority_then_fifo() {
    let harness = Harness::new();
    let queue = &harness.queue;

    queue.enqueue(task("a", "low").with_band(Priority::Low)).await.unwrap();
    harness.clock.advance(chrono::Duration::seconds(1));
    queue.enqueue(task("b", "high-first").with_band(Priority::High)).await.unwrap();
    harness.clock.advance(chrono::Duration::seconds(1));
    queue.enqueue(task("c", "normal")).await.unwrap();
    harness.clock.advance(chrono::Duration::seconds(1));
    queue.enqueue(task("d", "high-second").with_band(Priority::High)).await.unwrap();
    harness.clock.advance(chrono::Duration::seconds(1));
    queue.enqueue(task("e", "critical").with_band(Priority::Critical)).await.unwrap();

    for _ in 0..5 {
        assert!(matches!(
            queue.process_next_task().await,
            ProcessOutcome::Processed { .. }
        ));
    }
    assert_eq!(queue.process_next_task().await, ProcessOutcome::Idle);
    assert_eq!(
        harness.executor.calls(),
        vec!["critical", "high-first", "high-second", "normal", "low"]
    );
}

#[tokio::test]
async fn test_owner_default_priority_applies() {
    let mut config = EngineConfig::default();
    config.owners.default_priority = Priority::High;
    let harness = Harness::with_config(config);

    let queued = harness.queue.enqueue(task("alice", "x")).await.unwrap();
    assert_eq!(queued.priority, Priority::High.value());

    let explicit = harness
        .queue
        .enqueue(task("alice", "y").with_priority(2))
        .await
        .unwrap();
    assert_eq!(explicit.priority, 2);
}

#[tokio::test]
async fn test_invalid_payload_is_rejected() {
    let harness = Harness::new();
    let result = harness.queue.enqueue(task("alice", "   ")).await;
    assert!(matches!(result, Err(QueueError::InvalidPayload(_))));
    let result = harness.queue.enqueue(task("", "echo")).await;
    assert!(matches!(result, Err(QueueError::InvalidPayload(_))));
}

#[tokio::test]
#[traced_test]
async fn test_successful_task_lifecycle() {
    let harness = Harness::new();
    let mut events = harness.subscribe();

    let queued = harness.queue.enqueue(task("alice", "tokens:42")).await.unwrap();
    let outcome = harness.queue.process_next_task().await;
    assert_eq!(
        outcome,
        ProcessOutcome::Processed {
            task_id: queued.id,
            status: TaskStatus::Completed
        }
    );

    let stored = harness.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.output.as_deref(), Some("tokens:42"));
    assert!(stored.started_at.is_some());
    assert!(stored.completed_at.is_some());

    let executions = harness.store.executions_for_task(queued.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    let execution = &executions[0];
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.tokens_used, 42);
    assert_eq!(execution.attempts, 1);
    assert!(execution
        .phases
        .iter()
        .all(|p| p.status == taskmill::models::PhaseStatus::Completed));

    let names: Vec<&str> = drain(&mut events).iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["task:queued", "task:started", "task:completed"]);

    let rate = harness.rate_limiter.get_status().await.unwrap();
    assert_eq!(rate.daily_used, 42);
    assert_eq!(rate.minute_used, 1);

    assert!(logs_contain("Task state change: PENDING -> RUNNING"));
    assert!(logs_contain("Task state change: RUNNING -> COMPLETED"));
}

#[tokio::test]
async fn test_failed_task_records_error() {
    let harness = Harness::new();
    let mut events = harness.subscribe();

    let queued = harness.queue.enqueue(task("alice", "fail")).await.unwrap();
    let outcome = harness.queue.process_next_task().await;
    assert_eq!(
        outcome,
        ProcessOutcome::Processed {
            task_id: queued.id,
            status: TaskStatus::Failed
        }
    );

    let stored = harness.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(stored.error.as_deref(), Some("scripted failure"));
    let execution = &harness.store.executions_for_task(queued.id).await.unwrap()[0];
    assert_eq!(execution.status, ExecutionStatus::Failed);

    let failed = drain(&mut events)
        .into_iter()
        .any(|e| matches!(e, EngineEvent::TaskFailed { task_id, .. } if task_id == queued.id));
    assert!(failed);
}

#[tokio::test]
async fn test_retry_policy_retries_inside_running_state() {
    let mut config = EngineConfig::default();
    config.queue.retry = RetryPolicy::fixed(2, Duration::from_millis(1));
    let harness = Harness::build(config, ScriptedExecutor::new().fail_times("flaky", 2));

    let queued = harness.queue.enqueue(task("alice", "flaky")).await.unwrap();
    harness.queue.process_next_task().await;

    let stored = harness.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    let execution = &harness.store.executions_for_task(queued.id).await.unwrap()[0];
    assert_eq!(execution.attempts, 3);
    assert_eq!(harness.executor.calls().len(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_leave_partial_phase_progress() {
    let mut config = EngineConfig::default();
    config.queue.retry = RetryPolicy::fixed(1, Duration::from_millis(1));
    let harness = Harness::with_config(config);

    let queued = harness.queue.enqueue(task("alice", "fail")).await.unwrap();
    harness.queue.process_next_task().await;

    let execution = &harness.store.executions_for_task(queued.id).await.unwrap()[0];
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.attempts, 2);
    let progress: Vec<_> = execution
        .phases
        .iter()
        .map(|p| (p.id.as_str(), p.status, p.progress))
        .collect();
    assert_eq!(
        progress,
        vec![
            ("prepare", PhaseStatus::Completed, 100),
            ("execute", PhaseStatus::Error, 50),
            ("finalize", PhaseStatus::Pending, 0),
        ]
    );
}

#[tokio::test]
async fn test_executor_timeout_fails_task() {
    let mut config = EngineConfig::default();
    config.queue.task_timeout = Duration::from_millis(50);
    let harness = Harness::with_config(config);

    let queued = harness.queue.enqueue(task("alice", "sleep:5000")).await.unwrap();
    harness.queue.process_next_task().await;

    let stored = harness.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_cancel_pending_task() {
    let harness = Harness::new();
    let mut events = harness.subscribe();
    let queued = harness.queue.enqueue(task("alice", "never")).await.unwrap();

    assert!(harness.queue.cancel_task(queued.id).await.unwrap());
    let stored = harness.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Cancelled);

    assert_eq!(harness.queue.process_next_task().await, ProcessOutcome::Idle);
    assert!(harness.executor.calls().is_empty());
    assert!(!harness.queue.cancel_task(queued.id).await.unwrap());

    let cancelled = drain(&mut events)
        .iter()
        .filter(|e| e.name() == "task:cancelled")
        .count();
    assert_eq!(cancelled, 1);
}

#[tokio::test]
async fn test_cancel_unknown_task() {
    let harness = Harness::new();
    let result = harness.queue.cancel_task(uuid::Uuid::new_v4()).await;
    assert!(matches!(result, Err(QueueError::TaskNotFound(_))));
}

#[tokio::test]
async fn test_cancel_running_task_is_not_overwritten() {
    let harness = Harness::new();
    let queued = harness.queue.enqueue(task("alice", "sleep:5000")).await.unwrap();

    let queue = Arc::clone(&harness.queue);
    let processing = tokio::spawn(async move { queue.process_next_task().await });
    let queue = Arc::clone(&harness.queue);
    assert!(wait_for(Duration::from_secs(2), || {
        let queue = Arc::clone(&queue);
        async move { queue.is_in_flight(queued.id) }
    })
    .await);

    assert!(harness.queue.cancel_task(queued.id).await.unwrap());
    let outcome = processing.await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Processed {
            task_id: queued.id,
            status: TaskStatus::Cancelled
        }
    );

    let stored = harness.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Cancelled);
    let execution = &harness.store.executions_for_task(queued.id).await.unwrap()[0];
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(!harness.queue.is_in_flight(queued.id));
}

#[tokio::test]
async fn test_pause_and_resume_emit_one_event_each() {
    let harness = Harness::new();
    let mut events = harness.subscribe();
    harness.queue.enqueue(task("alice", "x")).await.unwrap();

    assert!(harness.queue.pause());
    assert!(!harness.queue.pause());
    assert_eq!(harness.queue.process_next_task().await, ProcessOutcome::Paused);
    assert_eq!(harness.queue.toggle(), QueueState::Active);
    assert!(!harness.queue.resume());

    let changes = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::QueueStatusChanged { .. }))
        .count();
    assert_eq!(changes, 2);
    assert!(matches!(
        harness.queue.process_next_task().await,
        ProcessOutcome::Processed { .. }
    ));
}

#[tokio::test]
async fn test_processing_loop_drains_queue_and_stops() {
    let harness = Harness::new();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = harness.queue.start(shutdown_rx);

    for i in 0..3 {
        harness
            .queue
            .enqueue(task("alice", &format!("cmd-{}", i)))
            .await
            .unwrap();
    }

    let store = Arc::clone(&harness.store);
    assert!(wait_for(Duration::from_secs(5), || {
        let store = Arc::clone(&store);
        async move { store.count_by_status(TaskStatus::Completed).await.unwrap() == 3 }
    })
    .await);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
    let status = harness.queue.status().await.unwrap();
    assert_eq!(status.pending, 0);
    assert_eq!(status.running, 0);
}
