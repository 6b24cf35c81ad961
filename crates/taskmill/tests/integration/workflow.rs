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

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use taskmill::models::{LogKind, StepAction, TaskTemplate};
use taskmill::store::TaskStore;
use taskmill::{
    EngineEvent, EventBus, RetryPolicy, TaskStatus, WorkflowDefinition, WorkflowError,
    WorkflowStatus, WorkflowStep,
};
use tokio::sync::broadcast;

use crate::fixtures::{drain, wait_for, FlakySink, Harness, RecordingHandler};

fn agent_step(id: &str, instructions: &str) -> WorkflowStep {
    WorkflowStep::new(
        id,
        StepAction::ExecuteAgentInstructions {
            instructions: instructions.to_string(),
            agent_type: None,
            priority: None,
        },
    )
}

fn notify_step(id: &str) -> WorkflowStep {
    WorkflowStep::new(
        id,
        StepAction::SendNotification {
            channel: "ops".to_string(),
            message: format!("{} done", id),
        },
    )
}

#[tokio::test]
async fn test_step_retry_then_dependent_step_runs() {
    let harness = Harness::new();
    let sink = Arc::new(FlakySink::new(1));
    let engine = harness.workflows_with_sink(sink.clone(), Arc::new(RecordingHandler::default()));

    engine
        .register_workflow(WorkflowDefinition::new(
            "a-then-b",
            vec!["project:created".to_string()],
            vec![
                agent_step("a", "scaffold the project")
                    .with_retry(RetryPolicy::fixed(1, Duration::from_millis(5))),
                agent_step("b", "write the readme").depends_on("a"),
            ],
        ))
        .await
        .unwrap();

    let executions = engine
        .trigger_workflows("project:created", json!({ "owner_id": "alice", "entity_id": "proj-1" }))
        .await
        .unwrap();

    assert_eq!(executions.len(), 1);
    let execution = &executions[0];
    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert_eq!(execution.log_entries(LogKind::StepRetry, "a").count(), 1);
    assert_eq!(execution.log_entries(LogKind::StepRetry, "b").count(), 0);
    assert!(execution.completed_steps.contains("a"));
    assert!(execution.completed_steps.contains("b"));
    assert_eq!(execution.progress, 1.0);

    let submitted = sink.submitted.lock();
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[0].payload.command, "scaffold the project");
    assert_eq!(submitted[0].entity_id.as_deref(), Some("proj-1"));
    assert_eq!(submitted[1].payload.metadata["step_id"], json!("b"));

    let stored = engine.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_unmet_dependency_skips_without_blocking_siblings() {
    let harness = Harness::new();
    let engine = harness.workflows(Arc::new(RecordingHandler::default()));

    // "a" depends on a later step, so it is always skipped; "b" depends on
    // the skipped step; "c" is independent.
    engine
        .register_workflow(WorkflowDefinition::new(
            "skips",
            vec![],
            vec![
                notify_step("a").depends_on("z"),
                notify_step("b").depends_on("a"),
                notify_step("c"),
                notify_step("z"),
            ],
        ))
        .await
        .unwrap();

    let execution = engine.run_workflow("skips", json!({})).await.unwrap();
    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert!(execution.skipped_steps.contains("a"));
    assert!(execution.skipped_steps.contains("b"));
    assert!(execution.completed_steps.contains("c"));
    assert!(execution.completed_steps.contains("z"));
    assert_eq!(execution.progress, 0.5);
    assert_eq!(execution.log_entries(LogKind::StepSkipped, "a").count(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_fail_execution() {
    let harness = Harness::new();
    let mut events = harness.subscribe();
    let engine = harness.workflows(Arc::new(RecordingHandler::default()));

    engine
        .register_workflow(WorkflowDefinition::new(
            "gated",
            vec![],
            vec![
                WorkflowStep::new(
                    "check",
                    StepAction::Condition {
                        pointer: "/approved".to_string(),
                        equals: json!(true),
                    },
                )
                .with_retry(RetryPolicy::fixed(2, Duration::from_millis(1))),
                notify_step("after").depends_on("check"),
            ],
        ))
        .await
        .unwrap();

    let execution = engine
        .run_workflow("gated", json!({ "approved": false }))
        .await
        .unwrap();

    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert!(execution
        .error
        .as_deref()
        .unwrap()
        .contains("failed after 3 attempt(s)"));
    assert_eq!(execution.log_entries(LogKind::StepRetry, "check").count(), 2);
    assert_eq!(execution.log_entries(LogKind::StepFailed, "check").count(), 1);
    assert!(!execution.completed_steps.contains("after"));
    assert!(execution.completed_at.is_some());

    let names: Vec<&str> = drain(&mut events).iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["workflow:started", "workflow:failed"]);
}

#[tokio::test]
async fn test_created_tasks_land_in_queue() {
    let harness = Harness::new();
    let engine = harness.workflows(Arc::new(RecordingHandler::default()));

    engine
        .register_workflow(WorkflowDefinition::new(
            "fan-out",
            vec!["project:created".to_string()],
            vec![WorkflowStep::new(
                "tasks",
                StepAction::CreateTasks {
                    tasks: vec![
                        TaskTemplate {
                            kind: "lint".to_string(),
                            command: "run-lint".to_string(),
                            priority: Some(8),
                            agent_type: None,
                        },
                        TaskTemplate {
                            kind: "test".to_string(),
                            command: "run-tests".to_string(),
                            priority: None,
                            agent_type: Some("tester".to_string()),
                        },
                    ],
                },
            )],
        ))
        .await
        .unwrap();

    let executions = engine
        .trigger_workflows("project:created", json!({ "owner_id": "alice" }))
        .await
        .unwrap();
    assert_eq!(executions[0].status, WorkflowStatus::Completed);

    let pending = harness
        .store
        .list_tasks_by_status(TaskStatus::Pending)
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|t| t.owner_id == "alice"));
}

#[tokio::test]
async fn test_missing_owner_fails_task_steps() {
    let harness = Harness::new();
    let engine = harness.workflows(Arc::new(RecordingHandler::default()));
    engine
        .register_workflow(WorkflowDefinition::new(
            "needs-owner",
            vec![],
            vec![agent_step("a", "do it")],
        ))
        .await
        .unwrap();

    let execution = engine.run_workflow("needs-owner", json!({})).await.unwrap();
    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert!(execution.error.unwrap().contains("owner_id"));
}

#[tokio::test]
async fn test_child_entities_step_uses_batch() {
    let harness = Harness::new();
    let handler = Arc::new(RecordingHandler::default());
    let engine = harness.workflows(handler.clone());

    engine
        .register_workflow(WorkflowDefinition::new(
            "children",
            vec![],
            vec![
                WorkflowStep::new(
                    "create",
                    StepAction::CreateChildEntities {
                        target_kind: "document".to_string(),
                        items: vec![json!({ "n": 1 }), json!({ "n": 2 }), json!({ "valid": false })],
                    },
                ),
                WorkflowStep::new(
                    "all-bad",
                    StepAction::CreateChildEntities {
                        target_kind: "document".to_string(),
                        items: vec![json!({ "valid": false })],
                    },
                )
                .depends_on("create"),
            ],
        ))
        .await
        .unwrap();

    let execution = engine.run_workflow("children", json!({})).await.unwrap();
    assert!(execution.completed_steps.contains("create"));
    assert_eq!(handler.applied.lock().len(), 2);
    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert!(execution.error.unwrap().contains("all-bad"));
}

#[tokio::test]
async fn test_inactive_workflows_are_not_triggered() {
    let harness = Harness::new();
    let engine = harness.workflows(Arc::new(RecordingHandler::default()));
    engine
        .register_workflow(WorkflowDefinition::new(
            "sometimes",
            vec!["task:completed".to_string()],
            vec![notify_step("n")],
        ))
        .await
        .unwrap();

    engine.set_workflow_active("sometimes", false).await.unwrap();
    let executions = engine
        .trigger_workflows("task:completed", json!({}))
        .await
        .unwrap();
    assert!(executions.is_empty());
    assert!(matches!(
        engine.run_workflow("sometimes", json!({})).await,
        Err(WorkflowError::Inactive(_))
    ));
    assert!(matches!(
        engine.run_workflow("missing", json!({})).await,
        Err(WorkflowError::NotFound(_))
    ));

    engine.set_workflow_active("sometimes", true).await.unwrap();
    let executions = engine
        .trigger_workflows("task:completed", json!({}))
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
}

#[tokio::test]
async fn test_cyclic_definition_is_rejected() {
    let harness = Harness::new();
    let engine = harness.workflows(Arc::new(RecordingHandler::default()));

    let result = engine
        .register_workflow(WorkflowDefinition::new(
            "cycle",
            vec![],
            vec![
                notify_step("a").depends_on("c"),
                notify_step("b").depends_on("a"),
                notify_step("c").depends_on("b"),
            ],
        ))
        .await;
    assert!(matches!(result, Err(WorkflowError::CyclicDependency { .. })));
    assert!(engine.get_workflow("cycle").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_running_execution() {
    let harness = Harness::new();
    let engine = harness.workflows(Arc::new(RecordingHandler::default()));
    engine
        .register_workflow(WorkflowDefinition::new(
            "slow",
            vec![],
            vec![
                WorkflowStep::new(
                    "wait",
                    StepAction::Wait {
                        duration: Duration::from_secs(30),
                    },
                ),
                notify_step("after"),
            ],
        ))
        .await
        .unwrap();

    let runner = Arc::clone(&engine);
    let run = tokio::spawn(async move { runner.run_workflow("slow", json!({})).await });

    let observer = Arc::clone(&engine);
    assert!(wait_for(Duration::from_secs(2), || {
        let observer = Arc::clone(&observer);
        async move { !observer.list_executions("slow").await.unwrap().is_empty() }
    })
    .await);
    let execution_id = engine.list_executions("slow").await.unwrap()[0].id;
    assert!(engine.cancel_execution(execution_id).await.unwrap());

    let execution = run.await.unwrap().unwrap();
    assert_eq!(execution.status, WorkflowStatus::Cancelled);
    assert!(!execution.completed_steps.contains("after"));
    assert!(!engine.cancel_execution(execution_id).await.unwrap());
}

#[tokio::test]
async fn test_listener_triggers_on_bus_events() {
    let harness = Harness::new();
    let engine = harness.workflows(Arc::new(RecordingHandler::default()));
    engine
        .register_workflow(WorkflowDefinition::new(
            "on-complete",
            vec!["task:completed".to_string()],
            vec![notify_step("announce")],
        ))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let listener = engine.listen(shutdown_rx);
    let mut events = harness.subscribe();

    harness.bus.publish(EngineEvent::TaskCompleted {
        task_id: uuid::Uuid::new_v4(),
        execution_id: uuid::Uuid::new_v4(),
        owner_id: "alice".to_string(),
        entity_id: "proj-1".to_string(),
        tokens_used: 5,
    });

    let notified = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(EngineEvent::Notification { channel, message, .. }) => {
                    break (channel, message);
                }
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(notified.0, "ops");
    assert_eq!(notified.1, "announce done");

    let execution = &engine.list_executions("on-complete").await.unwrap()[0];
    assert_eq!(execution.trigger_event.as_deref(), Some("task:completed"));
    assert_eq!(execution.context["owner_id"], json!("alice"));

    shutdown_tx.send(()).unwrap();
    listener.await.unwrap();
}

#[tokio::test]
async fn test_listener_shutdown_cancels_triggered_runs() {
    let harness = Harness::new();
    let engine = harness.workflows(Arc::new(RecordingHandler::default()));
    engine
        .register_workflow(WorkflowDefinition::new(
            "slow-on-complete",
            vec!["task:completed".to_string()],
            vec![
                WorkflowStep::new(
                    "wait",
                    StepAction::Wait {
                        duration: Duration::from_secs(30),
                    },
                ),
                notify_step("after"),
            ],
        ))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let listener = engine.listen(shutdown_rx);
    harness.bus.publish(EngineEvent::TaskCompleted {
        task_id: uuid::Uuid::new_v4(),
        execution_id: uuid::Uuid::new_v4(),
        owner_id: "alice".to_string(),
        entity_id: "proj-1".to_string(),
        tokens_used: 0,
    });

    let observer = Arc::clone(&engine);
    assert!(wait_for(Duration::from_secs(2), || {
        let observer = Arc::clone(&observer);
        async move {
            observer
                .list_executions("slow-on-complete")
                .await
                .unwrap()
                .iter()
                .any(|e| e.status == WorkflowStatus::Running)
        }
    })
    .await);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), listener)
        .await
        .expect("listener waits for its runs, not the 30s step")
        .unwrap();

    let executions = engine.list_executions("slow-on-complete").await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, WorkflowStatus::Cancelled);
    assert!(!executions[0].completed_steps.contains("after"));
}
