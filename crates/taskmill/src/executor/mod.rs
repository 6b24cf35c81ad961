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

//! Agent execution boundary.
//!
//! The queue never runs agent work itself; it hands the command to an
//! [`AgentExecutor`]. Executor failures are data: an implementation reports
//! them through [`ExecutionResult`] and never panics or returns an error.

mod process;

pub use process::ProcessExecutor;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Options for one agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteOptions {
    pub working_directory: Option<PathBuf>,
    /// Upper bound the executor should honor. The queue enforces it as well.
    pub timeout: Duration,
    pub project_id: Option<String>,
    pub agent_type: Option<String>,
}

impl ExecuteOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            working_directory: None,
            timeout,
            project_id: None,
            agent_type: None,
        }
    }
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub execution_time: Duration,
    pub tokens_used: u64,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>, tokens_used: u64, execution_time: Duration) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            execution_time,
            tokens_used,
        }
    }

    pub fn failure(error: impl Into<String>, execution_time: Duration) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            execution_time,
            tokens_used: 0,
        }
    }

    pub fn with_tokens(mut self, tokens_used: u64) -> Self {
        self.tokens_used = tokens_used;
        self
    }
}

/// Runs agent commands on behalf of the task queue.
///
/// `cancel` fires when the task is cancelled or the engine shuts down.
/// Implementations check it at their own suspension points and return a
/// failed result once they stop.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        command: &str,
        options: &ExecuteOptions,
        cancel: CancellationToken,
    ) -> ExecutionResult;
}
