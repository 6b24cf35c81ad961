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

//! Durable record of one run of a queued task.
//!
//! An execution carries an ordered list of phases. Exactly zero or one phase
//! is ACTIVE at any time and phases complete in non-decreasing order; the
//! methods on [`TaskExecution`] are the only way phases change state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PhaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    Pending,
    Active,
    Completed,
    Error,
}

/// One named phase of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub order: u32,
    pub status: PhaseStatus,
    /// Percentage in `0..=100`.
    pub progress: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub entity_id: String,
    pub status: ExecutionStatus,
    pub phases: Vec<Phase>,
    /// Executor attempts made so far, retries included.
    pub attempts: u32,
    pub tokens_used: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskExecution {
    /// A RUNNING execution with every phase PENDING.
    pub fn start(
        task_id: Uuid,
        entity_id: impl Into<String>,
        phase_ids: &[String],
        now: DateTime<Utc>,
    ) -> Self {
        let phases = phase_ids
            .iter()
            .enumerate()
            .map(|(order, id)| Phase {
                id: id.clone(),
                order: order as u32,
                status: PhaseStatus::Pending,
                progress: 0,
            })
            .collect();

        Self {
            id: Uuid::new_v4(),
            task_id,
            entity_id: entity_id.into(),
            status: ExecutionStatus::Running,
            phases,
            attempts: 0,
            tokens_used: 0,
            error: None,
            created_at: now,
            started_at: Some(now),
            updated_at: now,
            completed_at: None,
        }
    }

    /// Time since the execution record was created.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    pub fn active_phase(&self) -> Option<&Phase> {
        self.phases.iter().find(|p| p.status == PhaseStatus::Active)
    }

    /// Activates the lowest-ordered PENDING phase.
    pub fn start_next_phase(&mut self, now: DateTime<Utc>) -> Result<&Phase, PhaseError> {
        if let Some(active) = self.active_phase() {
            return Err(PhaseError::AlreadyActive(active.id.clone()));
        }

        let index = self
            .phases
            .iter()
            .enumerate()
            .filter(|(_, p)| p.status == PhaseStatus::Pending)
            .min_by_key(|(_, p)| p.order)
            .map(|(i, _)| i)
            .ok_or(PhaseError::NoPendingPhase)?;

        let order = self.phases[index].order;
        if let Some(blocking) = self
            .phases
            .iter()
            .find(|p| p.order < order && p.status != PhaseStatus::Completed)
        {
            return Err(PhaseError::OutOfOrder {
                phase: self.phases[index].id.clone(),
                blocking: blocking.id.clone(),
            });
        }

        self.phases[index].status = PhaseStatus::Active;
        self.updated_at = now;
        Ok(&self.phases[index])
    }

    /// Marks the active phase COMPLETED at 100%.
    pub fn complete_active_phase(&mut self, now: DateTime<Utc>) -> Result<(), PhaseError> {
        let phase = self
            .phases
            .iter_mut()
            .find(|p| p.status == PhaseStatus::Active)
            .ok_or(PhaseError::NoActivePhase)?;
        phase.status = PhaseStatus::Completed;
        phase.progress = 100;
        self.updated_at = now;
        Ok(())
    }

    /// Marks the active phase ERROR. No-op when nothing is active.
    pub fn fail_active_phase(&mut self, now: DateTime<Utc>) {
        if let Some(phase) = self
            .phases
            .iter_mut()
            .find(|p| p.status == PhaseStatus::Active)
        {
            phase.status = PhaseStatus::Error;
            self.updated_at = now;
        }
    }

    /// Raises the active phase's progress, capped at 100. Never lowers it.
    pub fn set_phase_progress(&mut self, progress: u8, now: DateTime<Utc>) -> Result<(), PhaseError> {
        let phase = self
            .phases
            .iter_mut()
            .find(|p| p.status == PhaseStatus::Active)
            .ok_or(PhaseError::NoActivePhase)?;
        phase.progress = progress.min(100).max(phase.progress);
        self.updated_at = now;
        Ok(())
    }

    /// Drives the execution to COMPLETED.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Drives the execution to FAILED with `reason`, erroring the active phase.
    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.fail_active_phase(now);
        self.status = ExecutionStatus::Failed;
        self.error = Some(reason.into());
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}
