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

//! Taskmill CLI - run agent task files and check engine configuration.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

/// Taskmill - priority task queue and workflow engine for agent work
#[derive(Parser)]
#[command(name = "taskmill")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, short, env = "TASKMILL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a file of tasks to completion and print their final status
    Run {
        /// JSON array of tasks ({owner_id, kind, payload: {command, ...}, priority?})
        #[arg(long)]
        tasks: PathBuf,

        /// JSON array of workflow definitions to register before the tasks run
        #[arg(long)]
        workflows: Option<PathBuf>,

        /// Directory holding entity artifacts for recovery
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,

        /// Give up waiting after this long (e.g., "30s", "10m", "1h")
        #[arg(long, default_value = "10m")]
        timeout: String,

        /// Shell used to run task commands
        #[arg(long, default_value = "sh")]
        shell: String,
    },
    /// Validate a configuration file and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            tasks,
            workflows,
            artifacts_dir,
            timeout,
            shell,
        } => {
            commands::run::run(commands::run::RunArgs {
                config: cli.config,
                tasks,
                workflows,
                artifacts_dir,
                timeout,
                shell,
            })
            .await?;
        }
        Commands::CheckConfig => {
            commands::check_config::run(cli.config.as_deref())?;
        }
    }

    Ok(())
}
