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

//! Per-owner admission settings.

use async_trait::async_trait;
use serde::Serialize;

use crate::config::OwnersConfig;
use crate::models::Priority;

/// Source of per-owner queue limits and default priorities.
#[async_trait]
pub trait OwnerSettings: Send + Sync {
    /// Maximum PENDING plus RUNNING tasks `owner_id` may hold.
    async fn max_queue_size(&self, owner_id: &str) -> usize;

    /// Band applied to tasks enqueued without an explicit priority.
    async fn default_priority(&self, owner_id: &str) -> Priority;
}

/// [`OwnerSettings`] read from the `[owners]` configuration section.
#[derive(Debug, Clone, Default)]
pub struct StaticOwnerSettings {
    config: OwnersConfig,
}

impl StaticOwnerSettings {
    pub fn new(config: OwnersConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl OwnerSettings for StaticOwnerSettings {
    async fn max_queue_size(&self, owner_id: &str) -> usize {
        self.config
            .overrides
            .get(owner_id)
            .and_then(|o| o.max_queue_size)
            .unwrap_or(self.config.default_max_queue_size)
    }

    async fn default_priority(&self, owner_id: &str) -> Priority {
        self.config
            .overrides
            .get(owner_id)
            .and_then(|o| o.default_priority)
            .unwrap_or(self.config.default_priority)
    }
}

/// Answer to "may this owner enqueue another task".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub allowed: bool,
    pub reason: Option<String>,
    pub current_size: usize,
    pub max_size: usize,
}

impl Admission {
    pub(crate) fn evaluate(current_size: usize, max_size: usize) -> Self {
        if current_size >= max_size {
            Self {
                allowed: false,
                reason: Some(format!(
                    "owner has {} active task(s), limit is {}",
                    current_size, max_size
                )),
                current_size,
                max_size,
            }
        } else {
            Self {
                allowed: true,
                reason: None,
                current_size,
                max_size,
            }
        }
    }
}
