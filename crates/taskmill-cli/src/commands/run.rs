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

//! Implementation of the `run` command.
//!
//! Wires an engine with the in-memory store and the shell executor, enqueues
//! every task from a JSON file and waits until the queue drains.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use taskmill::config::parse_duration;
use taskmill::{
    Engine, EngineBuilder, EngineContext, FsArtifactProbe, MemoryStore, NewTask, ProcessExecutor,
    WorkflowDefinition,
};
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct RunArgs {
    pub config: Option<PathBuf>,
    pub tasks: PathBuf,
    pub workflows: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    pub timeout: String,
    pub shell: String,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Run the `run` command.
pub async fn run(args: RunArgs) -> Result<()> {
    let timeout = parse_duration(&args.timeout)
        .with_context(|| format!("Invalid timeout: '{}'", args.timeout))?;
    let config = super::load_config(args.config.as_deref())?;
    let tasks: Vec<NewTask> = read_json(&args.tasks)?;
    let workflows: Vec<WorkflowDefinition> = match &args.workflows {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };

    let context = EngineContext::new(Arc::new(MemoryStore::new()), config);
    let mut builder = EngineBuilder::new(context)
        .executor(Arc::new(ProcessExecutor::with_shell(args.shell.clone())));
    if let Some(dir) = &args.artifacts_dir {
        builder = builder.artifact_probe(Arc::new(FsArtifactProbe::new(dir)));
    }
    let engine = builder.build().context("Failed to build engine")?;

    for definition in workflows {
        let id = definition.id.clone();
        engine
            .workflows()
            .register_workflow(definition)
            .await
            .with_context(|| format!("Failed to register workflow '{}'", id))?;
    }

    engine.start().await.context("Failed to start engine")?;

    let mut accepted = Vec::with_capacity(tasks.len());
    for task in tasks {
        match engine.queue().enqueue(task).await {
            Ok(queued) => accepted.push(queued.id),
            Err(e) => warn!("Task rejected: {}", e),
        }
    }
    info!("{} task(s) accepted", accepted.len());

    let drained = wait_until_drained(&engine, timeout).await?;

    let mut summary = Vec::with_capacity(accepted.len());
    for id in accepted {
        if let Some(task) = engine.queue().get_task(id).await? {
            summary.push(serde_json::json!({
                "task_id": task.id,
                "owner_id": task.owner_id,
                "status": task.status,
                "output": task.output,
                "error": task.error,
            }));
        }
    }
    engine.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !drained {
        bail!("Timed out after {} waiting for the queue to drain", args.timeout);
    }
    Ok(())
}

async fn wait_until_drained(engine: &Engine, timeout: Duration) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = engine.queue().status().await?;
        if status.pending == 0 && status.running == 0 {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                "Queue still has {} pending and {} running task(s) (state: {})",
                status.pending, status.running, status.state
            );
            return Ok(false);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
