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

use petgraph::algo::toposort;
use petgraph::{Directed, Graph};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::steps::{run_step, StepContext};
use super::{BatchRunner, TaskSink};
use crate::clock::Clock;
use crate::error::{BatchError, StepError, WorkflowError};
use crate::events::{EngineEvent, EventBus};
use crate::models::{
    BatchOperation, BatchOperationType, BatchOptions, LogKind, LogLevel, WorkflowDefinition,
    WorkflowExecution, WorkflowStatus, WorkflowStep,
};
use crate::retry::RetryPolicy;
use crate::store::Store;

/// Registers workflow definitions and runs them when their trigger events
/// are published.
pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    steps: StepContext,
    running: parking_lot::Mutex<HashMap<Uuid, CancellationToken>>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("running", &self.running.lock().len())
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn TaskSink>,
        batches: Arc<BatchRunner>,
    ) -> Self {
        Self {
            steps: StepContext {
                sink,
                batches,
                bus: Arc::clone(&bus),
            },
            store,
            bus,
            clock,
            running: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Validates and stores a workflow definition, replacing any definition
    /// with the same id.
    ///
    /// Step ids must be unique, every dependency must name a step of the
    /// workflow and the dependency graph must be acyclic. A dependency on a
    /// step declared later is accepted with a warning: steps run in declared
    /// order, so the dependent step will always be skipped.
    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        validate_definition(&definition)?;

        let mut seen = HashSet::new();
        for step in &definition.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    warn!(
                        "Workflow '{}': step '{}' depends on later step '{}' and will be skipped",
                        definition.id, step.id, dep
                    );
                }
            }
            seen.insert(step.id.as_str());
        }

        self.store.save_workflow(&definition).await?;
        info!(
            "Registered workflow '{}' ({} step(s), triggers: {:?})",
            definition.id,
            definition.steps.len(),
            definition.triggers
        );
        Ok(())
    }

    pub async fn set_workflow_active(&self, workflow_id: &str, active: bool) -> Result<(), WorkflowError> {
        let mut definition = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        definition.is_active = active;
        self.store.save_workflow(&definition).await?;
        info!(
            "Workflow '{}' {}",
            workflow_id,
            if active { "activated" } else { "deactivated" }
        );
        Ok(())
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowDefinition>, WorkflowError> {
        Ok(self.store.get_workflow(workflow_id).await?)
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        Ok(self.store.list_workflows().await?)
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, WorkflowError> {
        Ok(self.store.get_workflow_execution(id).await?)
    }

    pub async fn list_executions(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        Ok(self.store.list_workflow_executions(workflow_id).await?)
    }

    /// Runs every active workflow listing `event_type` as a trigger.
    ///
    /// Matching workflows run concurrently; each gets its own execution with
    /// `context` as its input. Returns the finished executions.
    pub async fn trigger_workflows(
        &self,
        event_type: &str,
        context: serde_json::Value,
    ) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        self.trigger(event_type, context, &CancellationToken::new())
            .await
    }

    /// Executions started here are cancelled when `stop` is.
    async fn trigger(
        &self,
        event_type: &str,
        context: serde_json::Value,
        stop: &CancellationToken,
    ) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        let matching: Vec<WorkflowDefinition> = self
            .store
            .list_workflows()
            .await?
            .into_iter()
            .filter(|w| w.is_active && w.matches_trigger(event_type))
            .collect();
        if matching.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            "Event '{}' triggers {} workflow(s)",
            event_type,
            matching.len()
        );

        let runs = matching
            .iter()
            .map(|definition| {
                self.execute(
                    definition,
                    Some(event_type.to_string()),
                    context.clone(),
                    stop.child_token(),
                )
            });
        let results = futures::future::join_all(runs).await;

        let mut executions = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(execution) => executions.push(execution),
                Err(e) => error!("Triggered workflow could not run: {}", e),
            }
        }
        Ok(executions)
    }

    /// Runs one workflow directly, without a trigger event.
    pub async fn run_workflow(
        &self,
        workflow_id: &str,
        context: serde_json::Value,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let definition = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        if !definition.is_active {
            return Err(WorkflowError::Inactive(workflow_id.to_string()));
        }
        self.execute(&definition, None, context, CancellationToken::new())
            .await
    }

    /// Requests cancellation of a running execution.
    ///
    /// # Returns
    ///
    /// `false` when the execution already finished.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<bool, WorkflowError> {
        let token = self.running.lock().get(&execution_id).cloned();
        if let Some(token) = token {
            token.cancel();
            info!("Workflow execution {} cancellation requested", execution_id);
            return Ok(true);
        }

        let mut execution = self
            .store
            .get_workflow_execution(execution_id)
            .await?
            .ok_or(WorkflowError::ExecutionNotFound(execution_id))?;
        if execution.status.is_terminal() {
            return Ok(false);
        }

        let now = self.clock.now();
        execution.log(now, LogLevel::Warn, LogKind::ExecutionCancelled, None, "cancelled by request");
        execution.finish(WorkflowStatus::Cancelled, None, now);
        self.store.save_workflow_execution(&execution).await?;
        self.bus.publish(EngineEvent::WorkflowCancelled {
            execution_id,
            workflow_id: execution.workflow_id.clone(),
        });
        Ok(true)
    }

    pub async fn create_batch_operation(
        &self,
        op_type: BatchOperationType,
        target_kind: &str,
        items: Vec<serde_json::Value>,
        options: Option<BatchOptions>,
    ) -> Result<BatchOperation, BatchError> {
        self.steps
            .batches
            .create_batch_operation(op_type, target_kind, items, options)
            .await
    }

    pub async fn cancel_batch(&self, id: Uuid) -> Result<bool, BatchError> {
        self.steps.batches.cancel_batch(id).await
    }

    pub async fn get_batch(&self, id: Uuid) -> Result<Option<BatchOperation>, BatchError> {
        self.steps.batches.get_batch(id).await
    }

    pub fn batches(&self) -> &Arc<BatchRunner> {
        &self.steps.batches
    }

    /// Subscribes to the event bus and triggers workflows for every event
    /// until `shutdown` fires.
    ///
    /// Workflow lifecycle events and notifications are not used as
    /// triggers. Each trigger runs on its own task so a long workflow does
    /// not hold up the events behind it. When `shutdown` fires, every
    /// execution the listener started is cancelled and awaited before the
    /// returned handle completes.
    pub fn listen(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            info!("Workflow listener started");
            let stop = CancellationToken::new();
            let mut runs = JoinSet::new();
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => {
                            if event.is_workflow_event() {
                                continue;
                            }
                            let name = event.name();
                            let context = event.payload();
                            let engine = Arc::clone(&engine);
                            let stop = stop.clone();
                            runs.spawn(async move {
                                if let Err(e) = engine.trigger(name, context, &stop).await {
                                    error!("Failed to trigger workflows for '{}': {}", name, e);
                                }
                            });
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Workflow listener lagged; {} event(s) dropped", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    Some(joined) = runs.join_next(), if !runs.is_empty() => {
                        if let Err(e) = joined {
                            error!("Triggered workflow run panicked: {}", e);
                        }
                    }
                    _ = shutdown.recv() => {
                        stop.cancel();
                        break;
                    }
                }
            }

            if !runs.is_empty() {
                info!("Waiting for {} triggered workflow run(s)", runs.len());
            }
            while let Some(joined) = runs.join_next().await {
                if let Err(e) = joined {
                    error!("Triggered workflow run panicked: {}", e);
                }
            }
            info!("Workflow listener stopped");
        })
    }

    async fn execute(
        &self,
        definition: &WorkflowDefinition,
        trigger_event: Option<String>,
        context: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let mut execution =
            WorkflowExecution::start(&definition.id, trigger_event, context, self.clock.now());
        self.running.lock().insert(execution.id, cancel.clone());

        let result = self.drive(definition, &mut execution, &cancel).await;
        self.running.lock().remove(&execution.id);
        result.map(|_| execution)
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        execution: &mut WorkflowExecution,
        cancel: &CancellationToken,
    ) -> Result<(), WorkflowError> {
        execution.log(
            self.clock.now(),
            LogLevel::Info,
            LogKind::ExecutionStarted,
            None,
            format!("Workflow '{}' started", definition.id),
        );
        self.store.save_workflow_execution(execution).await?;
        info!(
            "Workflow '{}' started (execution: {})",
            definition.id, execution.id
        );
        self.bus.publish(EngineEvent::WorkflowStarted {
            execution_id: execution.id,
            workflow_id: definition.id.clone(),
        });

        let total = definition.steps.len();
        let mut failure = None;
        for step in &definition.steps {
            if cancel.is_cancelled() {
                failure = Some(StepError::Cancelled);
                break;
            }

            let missing = execution.unmet_dependencies(step);
            if !missing.is_empty() {
                let skipped = StepError::DependencyUnmet {
                    step_id: step.id.clone(),
                    missing,
                };
                warn!("Execution {}: {}", execution.id, skipped);
                execution.skipped_steps.insert(step.id.clone());
                execution.log(
                    self.clock.now(),
                    LogLevel::Warn,
                    LogKind::StepSkipped,
                    Some(&step.id),
                    skipped.to_string(),
                );
                self.persist(execution).await;
                continue;
            }

            execution.log(
                self.clock.now(),
                LogLevel::Info,
                LogKind::StepStarted,
                Some(&step.id),
                format!("Step '{}' started", step.name),
            );
            match self.run_with_retry(step, execution, cancel).await {
                Ok(()) => {
                    execution.complete_step(&step.id, total);
                    execution.log(
                        self.clock.now(),
                        LogLevel::Info,
                        LogKind::StepCompleted,
                        Some(&step.id),
                        format!("Step '{}' completed", step.name),
                    );
                    self.persist(execution).await;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let now = self.clock.now();
        let workflow_id = definition.id.clone();
        let execution_id = execution.id;
        match failure {
            None => {
                if total == 0 {
                    execution.progress = 1.0;
                }
                execution.log(now, LogLevel::Info, LogKind::ExecutionCompleted, None, "Workflow completed");
                execution.finish(WorkflowStatus::Completed, None, now);
                info!("Workflow '{}' completed (execution: {})", workflow_id, execution_id);
                self.persist(execution).await;
                self.bus.publish(EngineEvent::WorkflowCompleted {
                    execution_id,
                    workflow_id,
                });
            }
            Some(StepError::Cancelled) => {
                execution.log(now, LogLevel::Warn, LogKind::ExecutionCancelled, None, "Workflow cancelled");
                execution.finish(WorkflowStatus::Cancelled, None, now);
                info!("Workflow '{}' cancelled (execution: {})", workflow_id, execution_id);
                self.persist(execution).await;
                self.bus.publish(EngineEvent::WorkflowCancelled {
                    execution_id,
                    workflow_id,
                });
            }
            Some(e) => {
                let message = e.to_string();
                execution.log(now, LogLevel::Error, LogKind::ExecutionFailed, None, message.clone());
                execution.finish(WorkflowStatus::Failed, Some(message.clone()), now);
                error!("Workflow '{}' failed (execution: {}): {}", workflow_id, execution_id, message);
                self.persist(execution).await;
                self.bus.publish(EngineEvent::WorkflowFailed {
                    execution_id,
                    workflow_id,
                    error: message,
                });
            }
        }
        Ok(())
    }

    async fn run_with_retry(
        &self,
        step: &WorkflowStep,
        execution: &mut WorkflowExecution,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let policy = step.retry_policy.clone().unwrap_or_else(RetryPolicy::none);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match run_step(&self.steps, step, execution, cancel).await {
                Ok(()) => return Ok(()),
                Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                Err(e) => e,
            };

            if !policy.should_retry(attempt) {
                let exhausted = StepError::RetryExhausted {
                    step_id: step.id.clone(),
                    attempts: attempt,
                    last_error: error.to_string(),
                };
                execution.log(
                    self.clock.now(),
                    LogLevel::Error,
                    LogKind::StepFailed,
                    Some(&step.id),
                    exhausted.to_string(),
                );
                return Err(exhausted);
            }

            let delay = policy.calculate_delay(attempt);
            warn!(
                "Step '{}' attempt {}/{} failed: {}; retrying in {:?}",
                step.id, attempt, policy.max_attempts, error, delay
            );
            execution.log(
                self.clock.now(),
                LogLevel::Warn,
                LogKind::StepRetry,
                Some(&step.id),
                format!("attempt {} failed: {}", attempt, error),
            );
            self.persist(execution).await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
            }
        }
    }

    async fn persist(&self, execution: &WorkflowExecution) {
        match self.store.save_workflow_execution(execution).await {
            Ok(true) => {}
            Ok(false) => debug!("Execution {} already terminal in store", execution.id),
            Err(e) => warn!("Failed to persist workflow execution {}: {}", execution.id, e),
        }
    }
}

fn validate_definition(definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let invalid = |message: String| WorkflowError::InvalidDefinition {
        workflow_id: definition.id.clone(),
        message,
    };

    if definition.id.trim().is_empty() {
        return Err(invalid("workflow id is empty".to_string()));
    }
    if definition.triggers.is_empty() {
        warn!("Workflow '{}' has no triggers and only runs directly", definition.id);
    }

    let mut graph = Graph::<String, (), Directed>::new();
    let mut node_indices = HashMap::new();
    for step in &definition.steps {
        if step.id.trim().is_empty() {
            return Err(invalid("step id is empty".to_string()));
        }
        let index = graph.add_node(step.id.clone());
        if node_indices.insert(step.id.as_str(), index).is_some() {
            return Err(invalid(format!("duplicate step id '{}'", step.id)));
        }
    }

    // Edges point from dependency to dependent.
    for step in &definition.steps {
        for dep in &step.depends_on {
            let dep_index = node_indices.get(dep.as_str()).ok_or_else(|| {
                invalid(format!("step '{}' depends on unknown step '{}'", step.id, dep))
            })?;
            graph.add_edge(*dep_index, node_indices[step.id.as_str()], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| WorkflowError::CyclicDependency {
        workflow_id: definition.id.clone(),
        step_id: graph[cycle.node_id()].clone(),
    })?;
    Ok(())
}
