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
use taskmill::models::StepAction;
use taskmill::store::TaskStore;
use taskmill::{
    BroadcastEventBus, EngineBuilder, EngineConfig, EngineContext, EngineEvent, EventBus,
    ManualClock, MemoryStore, TaskStatus, WorkflowDefinition, WorkflowStatus, WorkflowStep,
};
use tempfile::TempDir;
use tracing_test::traced_test;

use crate::fixtures::{start_time, task, wait_for, ScriptedExecutor};

fn announce_on_completion() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "announce",
        vec!["task:completed".to_string()],
        vec![WorkflowStep::new(
            "notify",
            StepAction::SendNotification {
                channel: "team".to_string(),
                message: "a task finished".to_string(),
            },
        )],
    )
}

#[tokio::test]
#[traced_test]
async fn test_engine_runs_tasks_and_triggers_workflows() {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(BroadcastEventBus::default());
    let context = EngineContext::new(store.clone(), EngineConfig::default())
        .with_bus(bus.clone())
        .with_clock(Arc::new(ManualClock::new(start_time())));
    let engine = EngineBuilder::new(context)
        .executor(Arc::new(ScriptedExecutor::new()))
        .build()
        .unwrap();

    engine
        .workflows()
        .register_workflow(announce_on_completion())
        .await
        .unwrap();
    let mut events = bus.subscribe();

    let report = engine.start().await.unwrap();
    assert_eq!(report.map(|r| r.candidates), Some(0));

    let queued = engine.queue().enqueue(task("alice", "tokens:25")).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(EngineEvent::Notification { message, .. }) = events.recv().await {
                break message;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(message, "a task finished");

    let task = store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(engine.rate_limiter().get_status().await.unwrap().daily_used, 25);

    let workflows = Arc::clone(engine.workflows());
    assert!(wait_for(Duration::from_secs(2), || {
        let workflows = Arc::clone(&workflows);
        async move {
            workflows
                .list_executions("announce")
                .await
                .unwrap()
                .iter()
                .any(|e| e.status == WorkflowStatus::Completed)
        }
    })
    .await);

    engine.shutdown().await;
    assert!(logs_contain("Engine started"));
    assert!(logs_contain("Engine stopped"));
}

#[tokio::test]
async fn test_engine_from_toml_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("taskmill.toml");
    std::fs::write(
        &path,
        r#"
[queue]
task_timeout = "30s"
phases = ["plan", "execute"]

[rate_limit]
daily_token_limit = 500

[recovery]
enabled = false
"#,
    )
    .unwrap();

    let config = EngineConfig::from_file(&path).unwrap();
    assert_eq!(config.queue.task_timeout, Duration::from_secs(30));
    assert_eq!(config.rate_limit.daily_token_limit, 500);

    let engine = EngineBuilder::new(EngineContext::new(Arc::new(MemoryStore::new()), config))
        .executor(Arc::new(ScriptedExecutor::new()))
        .build()
        .unwrap();

    assert_eq!(engine.start().await.unwrap(), None);
    let status = engine.queue().status().await.unwrap();
    assert_eq!(status.pending, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_engine_batches_need_a_handler() {
    let engine = EngineBuilder::new(EngineContext::new(
        Arc::new(MemoryStore::new()),
        EngineConfig::default(),
    ))
    .executor(Arc::new(ScriptedExecutor::new()))
    .build()
    .unwrap();

    let operation = engine
        .workflows()
        .create_batch_operation(
            taskmill::BatchOperationType::Create,
            "document",
            vec![json!({ "title": "a" })],
            None,
        )
        .await
        .unwrap();
    assert_eq!(operation.status, taskmill::BatchStatus::Failed);
    assert!(operation.errors[0].message.contains("no entity handler"));
}
