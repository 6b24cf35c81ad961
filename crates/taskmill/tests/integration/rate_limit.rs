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

use std::time::Duration;
use taskmill::store::TaskStore;
use taskmill::{EngineConfig, EngineEvent, PauseReason, ProcessOutcome, QueueState, TaskStatus};

use crate::fixtures::{drain, task, Harness};

fn limited(daily_tokens: u64, minute_requests: u32) -> Harness {
    let mut config = EngineConfig::default();
    config.rate_limit.daily_token_limit = daily_tokens;
    config.rate_limit.minute_request_limit = minute_requests;
    Harness::with_config(config)
}

#[tokio::test]
async fn test_exhausted_budget_pauses_without_dequeuing() {
    let harness = limited(100, 60);
    let mut events = harness.subscribe();
    harness.rate_limiter.record_usage(100).await.unwrap();
    let queued = harness.queue.enqueue(task("alice", "x")).await.unwrap();

    assert_eq!(
        harness.queue.process_next_task().await,
        ProcessOutcome::RateLimited
    );
    assert_eq!(harness.queue.state(), QueueState::Paused);
    assert_eq!(harness.queue.pause_reason(), Some(PauseReason::RateLimited));
    assert!(harness.executor.calls().is_empty());
    let stored = harness.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);

    // Further calls see the paused queue; no second transition.
    assert_eq!(harness.queue.process_next_task().await, ProcessOutcome::Paused);
    let transitions = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::QueueStatusChanged { .. }))
        .count();
    assert_eq!(transitions, 1);
}

#[tokio::test]
async fn test_daily_window_reset_resumes_queue() {
    let harness = limited(100, 60);
    harness.rate_limiter.record_usage(150).await.unwrap();
    harness.queue.enqueue(task("alice", "x")).await.unwrap();
    harness.queue.process_next_task().await;
    assert!(!harness.queue.resume_if_rate_window_reset().await);

    let wait = harness.rate_limiter.time_until_reset().await.unwrap().unwrap();
    assert_eq!(wait, Duration::from_secs(12 * 3600));

    harness.clock.advance(chrono::Duration::hours(12));
    assert!(harness.queue.resume_if_rate_window_reset().await);
    assert_eq!(harness.queue.state(), QueueState::Active);
    assert!(matches!(
        harness.queue.process_next_task().await,
        ProcessOutcome::Processed {
            status: TaskStatus::Completed,
            ..
        }
    ));

    let status = harness.rate_limiter.get_status().await.unwrap();
    assert_eq!(status.daily_used, 10);
}

#[tokio::test]
async fn test_minute_request_budget() {
    let harness = limited(1_000_000, 1);
    harness.queue.enqueue(task("alice", "first")).await.unwrap();
    harness.queue.enqueue(task("alice", "second")).await.unwrap();

    assert!(matches!(
        harness.queue.process_next_task().await,
        ProcessOutcome::Processed { .. }
    ));
    assert_eq!(
        harness.queue.process_next_task().await,
        ProcessOutcome::RateLimited
    );
    assert_eq!(harness.executor.calls(), vec!["first"]);

    harness.clock.advance(chrono::Duration::seconds(61));
    assert!(harness.queue.resume_if_rate_window_reset().await);
    assert!(matches!(
        harness.queue.process_next_task().await,
        ProcessOutcome::Processed { .. }
    ));
    assert_eq!(harness.executor.calls(), vec!["first", "second"]);
}

#[tokio::test]
async fn test_manual_pause_is_not_lifted_by_window_reset() {
    let harness = limited(100, 60);
    harness.rate_limiter.record_usage(100).await.unwrap();
    harness.queue.enqueue(task("alice", "x")).await.unwrap();
    harness.queue.process_next_task().await;

    // An operator pause takes over the rate-limit pause.
    assert!(!harness.queue.pause());
    assert_eq!(harness.queue.pause_reason(), Some(PauseReason::Manual));

    harness.clock.advance(chrono::Duration::days(1));
    assert!(!harness.queue.resume_if_rate_window_reset().await);
    assert_eq!(harness.queue.state(), QueueState::Paused);

    assert!(harness.queue.resume());
    assert_eq!(harness.queue.state(), QueueState::Active);
}

#[tokio::test]
async fn test_status_percentages_stay_in_range() {
    let harness = limited(100, 2);
    harness.rate_limiter.record_usage(250).await.unwrap();
    for _ in 0..3 {
        harness.rate_limiter.record_request().await.unwrap();
    }

    let status = harness.queue.status().await.unwrap();
    assert_eq!(status.rate.daily_percentage(), 100.0);
    assert_eq!(status.rate.minute_percentage(), 100.0);
    assert!(!harness.rate_limiter.can_proceed().await.unwrap());
}
