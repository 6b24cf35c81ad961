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

//! # Engine Wiring
//!
//! [`EngineContext`] holds what every component shares: the store, the event
//! bus, the clock and the configuration. [`EngineBuilder`] builds all four
//! components from one context, and [`Engine`] owns their background loops.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, ItemError, ValidationError};
use crate::events::{BroadcastEventBus, EventBus};
use crate::executor::AgentExecutor;
use crate::models::BatchOperationType;
use crate::queue::{OwnerSettings, StaticOwnerSettings, TaskQueue};
use crate::rate_limit::RateLimiter;
use crate::recovery::{ArtifactProbe, NoArtifacts, RecoveryReport, RecoveryService};
use crate::store::Store;
use crate::workflow::{BatchRunner, EntityHandler, TaskSink, WorkflowEngine};

/// Shared dependencies, constructed once at startup.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn EventBus>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
}

impl EngineContext {
    /// Context with a broadcast event bus and the system clock.
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        Self {
            store,
            bus: Arc::new(BroadcastEventBus::default()),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Handler used when the host registers none; rejects every item.
struct NoEntityHandler;

#[async_trait]
impl EntityHandler for NoEntityHandler {
    async fn validate(
        &self,
        _op: BatchOperationType,
        target_kind: &str,
        _item: &serde_json::Value,
    ) -> Result<(), ValidationError> {
        Err(ValidationError::new(format!(
            "no entity handler registered for '{}'",
            target_kind
        )))
    }

    async fn apply(
        &self,
        _op: BatchOperationType,
        target_kind: &str,
        _item: &serde_json::Value,
    ) -> Result<(), ItemError> {
        Err(ItemError::new(format!(
            "no entity handler registered for '{}'",
            target_kind
        )))
    }
}

/// Builds an [`Engine`] from a context.
///
/// Only the executor is required. Owner settings default to the `[owners]`
/// section of the configuration, batch items are rejected until an entity
/// handler is set, and the artifact probe reports no artifacts.
pub struct EngineBuilder {
    context: EngineContext,
    executor: Option<Arc<dyn AgentExecutor>>,
    settings: Option<Arc<dyn OwnerSettings>>,
    entity_handler: Option<Arc<dyn EntityHandler>>,
    probe: Option<Arc<dyn ArtifactProbe>>,
}

impl EngineBuilder {
    pub fn new(context: EngineContext) -> Self {
        Self {
            context,
            executor: None,
            settings: None,
            entity_handler: None,
            probe: None,
        }
    }

    pub fn executor(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn owner_settings(mut self, settings: Arc<dyn OwnerSettings>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn entity_handler(mut self, handler: Arc<dyn EntityHandler>) -> Self {
        self.entity_handler = Some(handler);
        self
    }

    pub fn artifact_probe(mut self, probe: Arc<dyn ArtifactProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        self.context.config.validate()?;
        let executor = self.executor.ok_or(EngineError::MissingExecutor)?;
        let EngineContext {
            store,
            bus,
            clock,
            config,
        } = self.context.clone();

        let settings = self
            .settings
            .unwrap_or_else(|| Arc::new(StaticOwnerSettings::new(config.owners.clone())));
        let rate_limiter = Arc::new(RateLimiter::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.rate_limit.clone(),
        ));
        let queue = Arc::new(TaskQueue::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&clock),
            Arc::clone(&rate_limiter),
            executor,
            settings,
            config.queue.clone(),
        ));

        let batches = Arc::new(BatchRunner::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&clock),
            self.entity_handler
                .unwrap_or_else(|| Arc::new(NoEntityHandler)),
            config.batch.clone(),
        ));
        let sink: Arc<dyn TaskSink> = Arc::clone(&queue) as Arc<dyn TaskSink>;
        let workflows = Arc::new(WorkflowEngine::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&clock),
            sink,
            batches,
        ));

        let recovery = Arc::new(RecoveryService::new(
            store,
            bus,
            clock,
            Arc::clone(&queue),
            self.probe.unwrap_or_else(|| Arc::new(NoArtifacts)),
            config.recovery.clone(),
        ));

        Ok(Engine {
            context: self.context,
            queue,
            rate_limiter,
            workflows,
            recovery,
            runtime_handles: RwLock::new(RuntimeHandles::default()),
        })
    }
}

/// Background loops started by [`Engine::start`].
#[derive(Default)]
struct RuntimeHandles {
    queue_handle: Option<tokio::task::JoinHandle<()>>,
    listener_handle: Option<tokio::task::JoinHandle<()>>,
    recovery_handle: Option<tokio::task::JoinHandle<()>>,
    shutdown_sender: Option<broadcast::Sender<()>>,
}

/// The assembled orchestration engine.
pub struct Engine {
    context: EngineContext,
    queue: Arc<TaskQueue>,
    rate_limiter: Arc<RateLimiter>,
    workflows: Arc<WorkflowEngine>,
    recovery: Arc<RecoveryService>,
    runtime_handles: RwLock<RuntimeHandles>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.context.config)
            .finish()
    }
}

impl Engine {
    /// Runs startup recovery (when enabled) and spawns the background loops:
    /// the workflow listener, the queue processing loop and the periodic
    /// recovery sweep.
    ///
    /// # Returns
    ///
    /// The startup recovery report, or `None` when recovery is disabled.
    pub async fn start(&self) -> Result<Option<RecoveryReport>, EngineError> {
        let mut handles = self.runtime_handles.write().await;
        if handles.shutdown_sender.is_some() {
            return Err(EngineError::AlreadyStarted);
        }

        let recovery_enabled = self.context.config.recovery.enabled;
        let report = if recovery_enabled {
            Some(self.recovery.recover_interrupted_tasks().await?)
        } else {
            None
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        // The listener subscribes first so it sees events from the first
        // tasks the queue picks up.
        handles.listener_handle = Some(self.workflows.listen(shutdown_tx.subscribe()));
        handles.queue_handle = Some(self.queue.start(shutdown_tx.subscribe()));
        if recovery_enabled {
            handles.recovery_handle = Some(self.recovery.spawn_periodic(shutdown_tx.subscribe()));
        }
        handles.shutdown_sender = Some(shutdown_tx);

        info!("Engine started (recovery: {})", recovery_enabled);
        Ok(report)
    }

    /// Signals every background loop to stop and waits for them. Tasks and
    /// triggered workflow runs still going are cancelled through their
    /// tokens, so their records end cancelled rather than running.
    pub async fn shutdown(&self) {
        let mut handles = self.runtime_handles.write().await;

        if let Some(sender) = handles.shutdown_sender.take() {
            let _ = sender.send(());
        }

        for handle in [
            handles.queue_handle.take(),
            handles.listener_handle.take(),
            handles.recovery_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            if let Err(e) = handle.await {
                warn!("Background loop ended abnormally: {}", e);
            }
        }
        info!("Engine stopped");
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }

    pub fn recovery(&self) -> &Arc<RecoveryService> {
        &self.recovery
    }
}
