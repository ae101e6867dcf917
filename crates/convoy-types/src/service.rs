//! Service records as observed on the platform

use crate::{ServiceKey, TaskDefinitionRevision, TaskSpec};
use serde::{Deserialize, Serialize};

/// Rollout state the platform reports for a service's primary deployment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RolloutState {
    #[default]
    Completed,
    InProgress,
    Failed,
    /// The platform's deployment circuit breaker reverted the service on its own
    RolledBack,
}

/// Snapshot of a service's current state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub key: ServiceKey,

    /// Revision the service currently runs
    pub current_revision: Option<TaskDefinitionRevision>,

    /// Revision the service ran before the last successful change
    pub previous_revision: Option<TaskDefinitionRevision>,

    /// Spec of the current revision, when known
    pub task_spec: Option<TaskSpec>,

    pub desired_count: u32,
    pub running_count: u32,
    pub pending_count: u32,

    /// Number of deployments the platform still tracks for this service
    pub deployment_count: u32,

    pub rollout_state: RolloutState,

    /// False for a service that has never been created (or was deleted)
    pub exists: bool,

    /// Whether interactive exec is enabled on the service
    #[serde(default)]
    pub enable_execute_command: bool,

    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl ServiceRecord {
    /// Record for a service the platform does not know about
    pub fn absent(key: ServiceKey) -> Self {
        Self {
            key,
            current_revision: None,
            previous_revision: None,
            task_spec: None,
            desired_count: 0,
            running_count: 0,
            pending_count: 0,
            deployment_count: 0,
            rollout_state: RolloutState::Completed,
            exists: false,
            enable_execute_command: false,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Running matches desired and no deployment is pending
    pub fn is_stable(&self) -> bool {
        self.exists
            && self.running_count == self.desired_count
            && self.pending_count == 0
            && self.deployment_count <= 1
            && self.rollout_state == RolloutState::Completed
    }

    /// The platform still tracks more than one deployment
    pub fn has_deployment_in_flight(&self) -> bool {
        self.deployment_count > 1 || self.rollout_state == RolloutState::InProgress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stable_record() -> ServiceRecord {
        ServiceRecord {
            current_revision: Some(TaskDefinitionRevision::new("app", 8)),
            desired_count: 3,
            running_count: 3,
            deployment_count: 1,
            exists: true,
            ..ServiceRecord::absent(ServiceKey::new("prod", "web"))
        }
    }

    #[test]
    fn test_stable_when_converged() {
        assert!(stable_record().is_stable());
    }

    #[test]
    fn test_not_stable_while_rolling() {
        let mut record = stable_record();
        record.deployment_count = 2;
        assert!(!record.is_stable());
        assert!(record.has_deployment_in_flight());

        let mut record = stable_record();
        record.running_count = 2;
        assert!(!record.is_stable());

        let mut record = stable_record();
        record.rollout_state = RolloutState::RolledBack;
        assert!(!record.is_stable());
    }

    #[test]
    fn test_absent_service_is_never_stable() {
        let record = ServiceRecord::absent(ServiceKey::new("prod", "web"));
        assert!(!record.exists);
        assert!(!record.is_stable());
    }
}
