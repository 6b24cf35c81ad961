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
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use taskmill::store::BatchStore;
use taskmill::{BatchError, BatchOperationType, BatchOptions, BatchStatus, EngineEvent};

use crate::fixtures::{drain, Harness, RecordingHandler};

fn items(count: usize, invalid_at: &[usize]) -> Vec<serde_json::Value> {
    (0..count)
        .map(|i| {
            if invalid_at.contains(&i) {
                json!({ "n": i, "valid": false })
            } else {
                json!({ "n": i })
            }
        })
        .collect()
}

#[tokio::test]
async fn test_partial_batch_with_bounded_concurrency() {
    let harness = Harness::new();
    let handler = Arc::new(RecordingHandler::default());
    let runner = harness.batches(handler.clone());
    let mut events = harness.subscribe();

    let options = BatchOptions {
        max_concurrency: 3,
        continue_on_error: true,
        ..BatchOptions::default()
    };
    let operation = runner
        .create_batch_operation(
            BatchOperationType::Create,
            "document",
            items(10, &[4]),
            Some(options),
        )
        .await
        .unwrap();

    assert_eq!(operation.status, BatchStatus::Completed);
    assert!(operation.is_partial());
    assert_eq!(operation.total_items, 10);
    assert_eq!(operation.processed_items, 10);
    assert_eq!(operation.successful_items, 9);
    assert_eq!(operation.failed_items, 1);
    assert_eq!(operation.errors.len(), 1);
    assert_eq!(operation.errors[0].item_index, 4);
    assert!(handler.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(handler.applied.lock().len(), 9);

    let events = drain(&mut events);
    let progress: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::BatchProgress {
                processed_items, ..
            } => Some(*processed_items),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 10);
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(progress.last(), Some(&10));
    assert!(matches!(events.first(), Some(EngineEvent::BatchCreated { total_items: 10, .. })));
    assert!(matches!(
        events.last(),
        Some(EngineEvent::BatchCompleted {
            status: BatchStatus::Completed,
            successful_items: 9,
            failed_items: 1,
            ..
        })
    ));

    let stored = harness.store.get_batch(operation.id).await.unwrap().unwrap();
    assert_eq!(stored, operation);
}

#[tokio::test]
async fn test_batch_with_every_item_invalid_fails() {
    let harness = Harness::new();
    let runner = harness.batches(Arc::new(RecordingHandler::default()));

    let operation = runner
        .create_batch_operation(BatchOperationType::Update, "document", items(3, &[0, 1, 2]), None)
        .await
        .unwrap();

    assert_eq!(operation.status, BatchStatus::Failed);
    assert_eq!(operation.failed_items, 3);
    assert_eq!(operation.processed_items, 3);
}

#[tokio::test]
async fn test_empty_batch_completes() {
    let harness = Harness::new();
    let runner = harness.batches(Arc::new(RecordingHandler::default()));

    let operation = runner
        .create_batch_operation(BatchOperationType::Delete, "document", Vec::new(), None)
        .await
        .unwrap();
    assert_eq!(operation.status, BatchStatus::Completed);
    assert_eq!(operation.progress(), 1.0);
}

#[tokio::test]
async fn test_apply_failures_without_validation() {
    let harness = Harness::new();
    let handler = Arc::new(RecordingHandler::default());
    let runner = harness.batches(handler.clone());

    let options = BatchOptions {
        validate_first: false,
        max_concurrency: 1,
        continue_on_error: false,
        ..BatchOptions::default()
    };
    let operation = runner
        .create_batch_operation(
            BatchOperationType::Create,
            "document",
            items(5, &[1]),
            Some(options),
        )
        .await
        .unwrap();

    // With one item in flight at a time, nothing is admitted after item 1.
    assert_eq!(operation.successful_items, 1);
    assert_eq!(operation.failed_items, 1);
    assert_eq!(operation.processed_items, 2);
    assert_eq!(operation.status, BatchStatus::Completed);
    assert_eq!(handler.applied.lock().len(), 1);
}

#[tokio::test]
async fn test_cancel_running_batch() {
    let harness = Harness::new();
    let runner = harness.batches(Arc::new(RecordingHandler::default()));

    let options = BatchOptions {
        max_concurrency: 1,
        item_delay: Some(Duration::from_millis(50)),
        ..BatchOptions::default()
    };
    let (running, handle) = runner
        .spawn_batch_operation(
            BatchOperationType::Create,
            "document",
            items(20, &[]),
            Some(options),
        )
        .await
        .unwrap();
    assert_eq!(running.status, BatchStatus::Running);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(runner.cancel_batch(running.id).await.unwrap());

    let finished = handle.await.unwrap().unwrap();
    assert_eq!(finished.status, BatchStatus::Cancelled);
    assert!(finished.processed_items < 20);
    assert!(!runner.cancel_batch(running.id).await.unwrap());
    assert!(matches!(
        runner.cancel_batch(uuid::Uuid::new_v4()).await,
        Err(BatchError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_invalid_options_are_rejected() {
    let harness = Harness::new();
    let runner = harness.batches(Arc::new(RecordingHandler::default()));

    let result = runner
        .create_batch_operation(BatchOperationType::Create, "  ", items(1, &[]), None)
        .await;
    assert!(matches!(result, Err(BatchError::InvalidOptions(_))));
}
