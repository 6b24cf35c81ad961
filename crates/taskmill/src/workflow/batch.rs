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

//! Bounded-concurrency batch processing.
//!
//! Items are admitted in order. Each admitted item holds a semaphore permit
//! while the handler applies it, so at most `max_concurrency` items are in
//! progress. Counter updates go through one async mutex that also persists
//! the record and publishes progress, which keeps the published progress
//! monotonic.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::EntityHandler;
use crate::clock::Clock;
use crate::error::BatchError;
use crate::events::{EngineEvent, EventBus};
use crate::models::{BatchOperation, BatchOperationType, BatchOptions, BatchStatus};
use crate::store::Store;

/// Runs batch operations against an [`EntityHandler`].
pub struct BatchRunner {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    handler: Arc<dyn EntityHandler>,
    defaults: BatchOptions,
    running: Arc<parking_lot::Mutex<HashMap<Uuid, CancellationToken>>>,
}

/// Everything one operation needs once it leaves the runner.
#[derive(Clone)]
struct Worker {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    handler: Arc<dyn EntityHandler>,
    running: Arc<parking_lot::Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl std::fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("defaults", &self.defaults)
            .field("running", &self.running.lock().len())
            .finish()
    }
}

impl BatchRunner {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        handler: Arc<dyn EntityHandler>,
        defaults: BatchOptions,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            handler,
            defaults,
            running: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    pub fn default_options(&self) -> &BatchOptions {
        &self.defaults
    }

    /// Runs a batch operation to completion.
    ///
    /// # Arguments
    ///
    /// * `op_type` - Create, update or delete
    /// * `target_kind` - Kind of entity the items describe
    /// * `items` - One JSON document per item
    /// * `options` - Overrides the configured defaults when given
    ///
    /// # Returns
    ///
    /// The terminal operation record. Item failures are counted on the
    /// record, not returned as errors.
    pub async fn create_batch_operation(
        &self,
        op_type: BatchOperationType,
        target_kind: &str,
        items: Vec<serde_json::Value>,
        options: Option<BatchOptions>,
    ) -> Result<BatchOperation, BatchError> {
        let options = options.unwrap_or_else(|| self.defaults.clone());
        let (operation, cancel) = self
            .prepare(op_type, target_kind, items.len(), &options)
            .await?;
        run_operation(self.worker(), operation, items, options, cancel).await
    }

    /// Starts a batch operation in the background.
    ///
    /// Returns the RUNNING record, whose id can be passed to
    /// [`cancel_batch`](Self::cancel_batch), and a handle resolving to the
    /// terminal record.
    pub async fn spawn_batch_operation(
        &self,
        op_type: BatchOperationType,
        target_kind: &str,
        items: Vec<serde_json::Value>,
        options: Option<BatchOptions>,
    ) -> Result<(BatchOperation, JoinHandle<Result<BatchOperation, BatchError>>), BatchError> {
        let options = options.unwrap_or_else(|| self.defaults.clone());
        let (operation, cancel) = self
            .prepare(op_type, target_kind, items.len(), &options)
            .await?;
        let handle = tokio::spawn(run_operation(
            self.worker(),
            operation.clone(),
            items,
            options,
            cancel,
        ));
        Ok((operation, handle))
    }

    async fn prepare(
        &self,
        op_type: BatchOperationType,
        target_kind: &str,
        total_items: usize,
        options: &BatchOptions,
    ) -> Result<(BatchOperation, CancellationToken), BatchError> {
        if options.max_concurrency == 0 {
            return Err(BatchError::InvalidOptions(
                "max_concurrency must be greater than zero".to_string(),
            ));
        }
        if target_kind.trim().is_empty() {
            return Err(BatchError::InvalidOptions("target_kind is empty".to_string()));
        }

        let mut operation = BatchOperation::new(op_type, target_kind, total_items, self.clock.now());
        operation.status = BatchStatus::Running;
        self.store.save_batch(&operation).await?;

        let cancel = CancellationToken::new();
        self.running.lock().insert(operation.id, cancel.clone());

        info!(
            "Batch {} created: {} {} item(s) of {} (concurrency: {})",
            operation.id,
            op_type.as_str(),
            total_items,
            target_kind,
            options.max_concurrency
        );
        self.bus.publish(EngineEvent::BatchCreated {
            batch_id: operation.id,
            target_kind: target_kind.to_string(),
            total_items,
        });
        Ok((operation, cancel))
    }

    fn worker(&self) -> Worker {
        Worker {
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            clock: Arc::clone(&self.clock),
            handler: Arc::clone(&self.handler),
            running: Arc::clone(&self.running),
        }
    }

    /// Stops admitting items of a running batch; it ends `cancelled`.
    ///
    /// # Returns
    ///
    /// `false` when the batch already reached a terminal status.
    pub async fn cancel_batch(&self, id: Uuid) -> Result<bool, BatchError> {
        let token = self.running.lock().get(&id).cloned();
        if let Some(token) = token {
            token.cancel();
            info!("Batch {} cancellation requested", id);
            return Ok(true);
        }

        let mut operation = self
            .store
            .get_batch(id)
            .await?
            .ok_or(BatchError::NotFound(id))?;
        if operation.status.is_terminal() {
            return Ok(false);
        }

        // Not running in this process; close the record directly.
        operation.finish(BatchStatus::Cancelled, self.clock.now());
        self.store.save_batch(&operation).await?;
        self.bus.publish(EngineEvent::BatchCancelled { batch_id: id });
        Ok(true)
    }

    pub async fn get_batch(&self, id: Uuid) -> Result<Option<BatchOperation>, BatchError> {
        Ok(self.store.get_batch(id).await?)
    }
}

type SharedOperation = Arc<tokio::sync::Mutex<BatchOperation>>;

async fn run_operation(
    worker: Worker,
    operation: BatchOperation,
    items: Vec<serde_json::Value>,
    options: BatchOptions,
    cancel: CancellationToken,
) -> Result<BatchOperation, BatchError> {
    let batch_id = operation.id;
    let op_type = operation.op_type;
    let target_kind = operation.target_kind.clone();
    let state: SharedOperation = Arc::new(tokio::sync::Mutex::new(operation));

    let mut invalid = HashSet::new();
    if options.validate_first {
        for (index, item) in items.iter().enumerate() {
            if let Err(e) = worker.handler.validate(op_type, &target_kind, item).await {
                debug!("Batch {} item {} failed validation: {}", batch_id, index, e.message);
                invalid.insert(index);
                record(&worker, &state, index, Err(e.message)).await;
            }
        }
        if !invalid.is_empty() {
            warn!(
                "Batch {}: {} item(s) failed validation",
                batch_id,
                invalid.len()
            );
        }
    }

    let stop = Arc::new(AtomicBool::new(!invalid.is_empty() && !options.continue_on_error));
    let semaphore = Arc::new(Semaphore::new(options.max_concurrency));
    let mut workers = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        if invalid.contains(&index) {
            continue;
        }
        if stop.load(Ordering::SeqCst) || cancel.is_cancelled() {
            break;
        }

        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = cancel.cancelled() => break,
        };
        // A failure may have landed while we waited for the permit.
        if stop.load(Ordering::SeqCst) || cancel.is_cancelled() {
            break;
        }

        let item_worker = worker.clone();
        let item_state = Arc::clone(&state);
        let item_stop = Arc::clone(&stop);
        let kind = target_kind.clone();
        let continue_on_error = options.continue_on_error;
        workers.spawn(async move {
            let result = item_worker
                .handler
                .apply(op_type, &kind, &item)
                .await
                .map_err(|e| e.message);
            if result.is_err() && !continue_on_error {
                item_stop.store(true, Ordering::SeqCst);
            }
            record(&item_worker, &item_state, index, result).await;
            drop(permit);
        });

        if let Some(delay) = options.item_delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break,
            }
        }
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("Batch {} item worker panicked: {}", batch_id, e);
        }
    }

    let mut operation = state.lock().await.clone();
    let status = if cancel.is_cancelled() {
        BatchStatus::Cancelled
    } else {
        operation.final_status()
    };
    operation.finish(status, worker.clock.now());
    let saved = worker.store.save_batch(&operation).await;
    worker.running.lock().remove(&batch_id);
    saved?;

    if status == BatchStatus::Cancelled {
        info!(
            "Batch {} cancelled after {}/{} item(s)",
            batch_id, operation.processed_items, operation.total_items
        );
        worker
            .bus
            .publish(EngineEvent::BatchCancelled { batch_id });
    } else {
        info!(
            "Batch {} {}: {} succeeded, {} failed",
            batch_id, status, operation.successful_items, operation.failed_items
        );
        worker.bus.publish(EngineEvent::BatchCompleted {
            batch_id,
            status,
            successful_items: operation.successful_items,
            failed_items: operation.failed_items,
        });
    }
    Ok(operation)
}

/// Applies one item result to the shared record, persists it and publishes
/// progress while still holding the lock.
async fn record(
    worker: &Worker,
    state: &SharedOperation,
    index: usize,
    result: Result<(), String>,
) {
    let mut operation = state.lock().await;
    match result {
        Ok(()) => operation.record_success(),
        Err(message) => operation.record_failure(index, message),
    }
    if let Err(e) = worker.store.save_batch(&operation).await {
        warn!("Failed to persist progress of batch {}: {}", operation.id, e);
    }
    worker.bus.publish(EngineEvent::BatchProgress {
        batch_id: operation.id,
        processed_items: operation.processed_items,
        total_items: operation.total_items,
    });
}
