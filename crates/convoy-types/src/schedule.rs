//! Scheduled work

use crate::{ClusterId, DeploymentRequest, ScheduleEntryId, TaskSpec};
use serde::{Deserialize, Serialize};

/// A one-shot task run, e.g. a nightly image scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRun {
    pub cluster: ClusterId,
    pub job_name: String,
    pub task: TaskSpec,
    #[serde(default = "default_one")]
    pub count: u32,
    /// Platform-level run attempts
    #[serde(default = "default_one")]
    pub attempts: u32,
}

fn default_one() -> u32 {
    1
}

/// What a schedule entry fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleTarget {
    /// Submit a copy of the template request
    Deployment { request: DeploymentRequest },
    /// Run a task to completion outside any service
    RunTask(BatchRun),
}

/// A recurring trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: ScheduleEntryId,
    /// `rate(...)`, `cron(...)` or a five-field cron expression
    pub expression: String,
    pub target: ScheduleTarget,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleEntry {
    pub fn new(id: impl Into<String>, expression: impl Into<String>, target: ScheduleTarget) -> Self {
        Self {
            id: ScheduleEntryId::new(id),
            expression: expression.into(),
            target,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
