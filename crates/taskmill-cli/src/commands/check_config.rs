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

//! Implementation of the `check-config` command.

use anyhow::{Context, Result};
use std::path::Path;
use taskmill::config::format_duration;
use tracing::info;

/// Validates the configuration and prints it back as TOML with every default
/// filled in.
pub fn run(path: Option<&Path>) -> Result<()> {
    let config = super::load_config(path)?;

    info!(
        "Configuration valid: task timeout {}, {} tokens/day, {} requests/minute, recovery {}",
        format_duration(config.queue.task_timeout),
        config.rate_limit.daily_token_limit,
        config.rate_limit.minute_request_limit,
        if config.recovery.enabled { "enabled" } else { "disabled" }
    );

    let rendered = config
        .to_toml_string()
        .context("Failed to render configuration")?;
    println!("{}", rendered);
    Ok(())
}
