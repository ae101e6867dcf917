//! Control-plane context and task defaults

use serde::{Deserialize, Serialize};

/// Where this control plane runs; stamped on every event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneContext {
    pub account_id: String,
    pub region: String,
    pub project: String,
    pub environment: String,
}

impl Default for ControlPlaneContext {
    fn default() -> Self {
        Self {
            account_id: "000000000000".to_string(),
            region: "local".to_string(),
            project: "convoy".to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Values used when neither the request nor the running service provides one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefaults {
    pub cpu: u32,
    pub memory: u32,
    /// Desired count of a service with no prior revision
    pub desired_count: u32,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            cpu: crate::task::DEFAULT_TASK_CPU,
            memory: crate::task::DEFAULT_TASK_MEMORY,
            desired_count: 2,
        }
    }
}
