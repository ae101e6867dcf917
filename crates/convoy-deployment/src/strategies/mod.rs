//! Deployment strategy implementations
//!
//! Each strategy expands a resolved target state into ordered plan steps and,
//! where it can undo itself, a rollback plan.

pub mod batch;
pub mod blue_green;
pub mod config_change;
pub mod hotfix;
pub mod normal;
pub mod rollback;
pub mod rolling;

pub use batch::ScheduledBatchPlanner;
pub use blue_green::BlueGreenPlanner;
pub use config_change::ConfigChangePlanner;
pub use hotfix::HotfixPlanner;
pub use normal::NormalPlanner;
pub use rollback::RollbackPlanner;
pub use rolling::RollingPlanner;

use crate::error::Result;
use crate::resolver::TargetState;
use convoy_types::{
    DeploymentConfiguration, DeploymentRequest, Guard, PlanStep, RevisionRef, RollbackPlan,
    ServiceDefinition, ServiceKey, ServiceUpdate, Step, Strategy,
};
use std::time::Duration;

/// Timeouts applied to generated steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTimeouts {
    /// Single platform calls
    pub step: Duration,
    /// Waits for steady state and task runs
    pub stable: Duration,
}

/// Forward steps and optional compensation produced by a planner
#[derive(Debug, Clone, Default)]
pub struct PlannedSteps {
    pub steps: Vec<PlanStep>,
    pub rollback: Option<RollbackPlan>,
}

/// Trait for strategy planners
pub trait StepPlanner: Send + Sync {
    /// Expand the target state into plan steps
    fn plan(
        &self,
        target: &TargetState,
        request: &DeploymentRequest,
        timeouts: &StepTimeouts,
    ) -> Result<PlannedSteps>;

    /// Strategy name for logging
    fn name(&self) -> &str;

    /// Whether a manual approval gate may be inserted
    fn allows_approval_gate(&self) -> bool {
        true
    }
}

/// Factory for creating strategy planners
pub fn create_planner(strategy: &Strategy) -> Box<dyn StepPlanner> {
    match strategy {
        Strategy::Normal => Box::new(NormalPlanner),
        Strategy::Rolling {
            max_percent,
            min_healthy_percent,
        } => Box::new(RollingPlanner::new(*max_percent, *min_healthy_percent)),
        Strategy::BlueGreen {
            traffic,
            green_service,
        } => Box::new(BlueGreenPlanner::new(traffic.clone(), green_service.clone())),
        Strategy::Hotfix { .. } => Box::new(HotfixPlanner),
        Strategy::Rollback { .. } => Box::new(RollbackPlanner),
        Strategy::ConfigChange { .. } => Box::new(ConfigChangePlanner),
        Strategy::ScheduledBatch { count, attempts } => {
            Box::new(ScheduledBatchPlanner::new(*count, *attempts))
        }
    }
}

pub(crate) fn register(target: &TargetState, timeouts: &StepTimeouts) -> PlanStep {
    PlanStep::new(
        Step::RegisterTaskDefinition {
            spec: target.task_spec.clone(),
        },
        timeouts.step,
    )
}

/// UpdateService for an existing service, CreateService otherwise
pub(crate) fn deploy(
    target: &TargetState,
    update: ServiceUpdate,
    timeouts: &StepTimeouts,
) -> PlanStep {
    if target.service_exists {
        return PlanStep::new(
            Step::UpdateService {
                key: target.key.clone(),
                update,
            },
            timeouts.step,
        )
        .guarded(Guard::NoDeploymentInFlight(target.key.clone()));
    }

    PlanStep::new(
        Step::CreateService {
            service: ServiceDefinition {
                key: target.key.clone(),
                revision: update.revision.unwrap_or(RevisionRef::Registered),
                desired_count: update.desired_count.unwrap_or(target.desired_count),
                deployment_configuration: update.deployment_configuration.unwrap_or_default(),
                enable_execute_command: target.task_spec.enable_execute_command,
                target_group: None,
            },
        },
        timeouts.step,
    )
    .guarded(Guard::ServiceAbsent(target.key.clone()))
}

pub(crate) fn wait(key: &ServiceKey, timeouts: &StepTimeouts) -> PlanStep {
    PlanStep::new(Step::WaitForStable { key: key.clone() }, timeouts.stable)
}

/// Revision change plus desired count, with the exec flag forwarded
pub(crate) fn revision_update(
    target: &TargetState,
    revision: RevisionRef,
    deployment_configuration: Option<DeploymentConfiguration>,
) -> ServiceUpdate {
    ServiceUpdate {
        revision: Some(revision),
        desired_count: Some(target.desired_count),
        deployment_configuration,
        force_new_deployment: false,
        enable_execute_command: Some(target.task_spec.enable_execute_command),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use convoy_types::{ContainerSpec, TaskDefinitionRevision, TaskSpec};

    pub fn timeouts() -> StepTimeouts {
        StepTimeouts {
            step: Duration::from_secs(600),
            stable: Duration::from_secs(600),
        }
    }

    pub fn existing_target() -> TargetState {
        let spec = TaskSpec::new("app")
            .with_cpu(256)
            .with_memory(512)
            .with_container(ContainerSpec::new("app", "app:v2").with_port(80));
        TargetState {
            key: ServiceKey::new("prod", "web"),
            task_spec: spec,
            desired_count: 3,
            current_revision: Some(TaskDefinitionRevision::new("app", 8)),
            previous_revision: Some(TaskDefinitionRevision::new("app", 7)),
            rollback_to: None,
            definition_changed: true,
            service_exists: true,
            scaling_policy: None,
        }
    }

    pub fn new_target() -> TargetState {
        TargetState {
            current_revision: None,
            previous_revision: None,
            service_exists: false,
            ..existing_target()
        }
    }
}
