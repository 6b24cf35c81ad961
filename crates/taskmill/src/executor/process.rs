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

//! Executor that runs commands through the system shell.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AgentExecutor, ExecuteOptions, ExecutionResult};
use crate::error::ExecutionError;

/// Runs each command with `sh -c`.
///
/// Stdout becomes the task output. A line of the form `tokens_used=<n>`
/// anywhere in stdout reports token usage; the last such line wins. The child
/// is killed when the task is cancelled or the timeout elapses.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    shell: String,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Uses `shell` instead of `sh`. It is invoked as `<shell> -c <command>`.
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts the reported token count from command output.
pub(crate) fn parse_tokens_used(output: &str) -> u64 {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("tokens_used="))
        .filter_map(|value| value.trim().parse::<u64>().ok())
        .last()
        .unwrap_or(0)
}

#[async_trait]
impl AgentExecutor for ProcessExecutor {
    async fn execute(
        &self,
        command: &str,
        options: &ExecuteOptions,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.working_directory {
            cmd.current_dir(dir);
        }
        if let Some(project_id) = &options.project_id {
            cmd.env("TASKMILL_PROJECT_ID", project_id);
        }
        if let Some(agent_type) = &options.agent_type {
            cmd.env("TASKMILL_AGENT_TYPE", agent_type);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn agent command: {}", e);
                return ExecutionResult::failure(
                    ExecutionError::Spawn(e.to_string()).to_string(),
                    started.elapsed(),
                );
            }
        };
        debug!("Spawned agent command (pid: {:?})", child.id());

        // Dropping the wait future drops the child, which kills it.
        let outcome = tokio::select! {
            output = child.wait_with_output() => Ok(output),
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            _ = tokio::time::sleep(options.timeout) => Err(ExecutionError::Timeout(options.timeout)),
        };

        let elapsed = started.elapsed();
        match outcome {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let tokens = parse_tokens_used(&stdout);
                if output.status.success() {
                    ExecutionResult::success(stdout, tokens, elapsed)
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    ExecutionResult::failure(
                        ExecutionError::NonZeroExit {
                            code: output.status.code(),
                            stderr,
                        }
                        .to_string(),
                        elapsed,
                    )
                    .with_tokens(tokens)
                }
            }
            Ok(Err(e)) => ExecutionResult::failure(
                ExecutionError::Spawn(e.to_string()).to_string(),
                elapsed,
            ),
            Err(e) => ExecutionResult::failure(e.to_string(), elapsed),
        }
    }
}
