//! Rolling deployment strategy

use super::{deploy, register, revision_update, wait, PlannedSteps, StepPlanner, StepTimeouts};
use crate::error::{DeploymentError, Result};
use crate::resolver::TargetState;
use convoy_types::{
    CircuitBreakerConfig, DeploymentConfiguration, DeploymentRequest, PlanStep, RevisionRef,
    RollbackPlan, ServiceUpdate, Step,
};

/// Rolling deployment planner
///
/// Lets the platform replace tasks within the running/healthy bounds, with
/// the deployment circuit breaker switched on.
pub struct RollingPlanner {
    /// Upper bound on running tasks, percent of desired
    max_percent: u32,
    /// Lower bound on healthy tasks, percent of desired
    min_healthy_percent: u32,
}

impl RollingPlanner {
    pub fn new(max_percent: u32, min_healthy_percent: u32) -> Self {
        Self {
            max_percent,
            min_healthy_percent,
        }
    }
}

impl StepPlanner for RollingPlanner {
    fn plan(
        &self,
        target: &TargetState,
        _request: &DeploymentRequest,
        timeouts: &StepTimeouts,
    ) -> Result<PlannedSteps> {
        if self.min_healthy_percent > 100 {
            return Err(DeploymentError::InvalidSpec(format!(
                "minimum healthy percent {} exceeds 100",
                self.min_healthy_percent
            )));
        }
        if !(100..=200).contains(&self.max_percent) {
            return Err(DeploymentError::InvalidSpec(format!(
                "maximum percent {} is outside [100, 200]",
                self.max_percent
            )));
        }

        let config = DeploymentConfiguration {
            maximum_percent: self.max_percent,
            minimum_healthy_percent: self.min_healthy_percent,
            circuit_breaker: CircuitBreakerConfig {
                enable: true,
                rollback: true,
            },
        };

        let steps = vec![
            register(target, timeouts),
            deploy(
                target,
                revision_update(target, RevisionRef::Registered, Some(config)),
                timeouts,
            ),
            wait(&target.key, timeouts),
        ];

        // Revert to the running revision, only if the update went out
        let rollback = match (&target.current_revision, target.service_exists) {
            (Some(current), true) => Some(RollbackPlan {
                steps: vec![
                    PlanStep::new(
                        Step::UpdateService {
                            key: target.key.clone(),
                            update: ServiceUpdate::revision(RevisionRef::Fixed(current.clone())),
                        },
                        timeouts.step,
                    )
                    .only_if_completed(1),
                    wait(&target.key, timeouts).only_if_completed(1),
                ],
            }),
            _ => None,
        };

        Ok(PlannedSteps { steps, rollback })
    }

    fn name(&self) -> &str {
        "rolling"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::fixtures::*;
    use convoy_types::{ServiceKey, Strategy};

    #[test]
    fn test_rolling_carries_bounds_and_breaker() {
        let target = existing_target();
        let request = DeploymentRequest::new(ServiceKey::new("prod", "web"), Strategy::rolling());
        let planned = RollingPlanner::new(200, 50)
            .plan(&target, &request, &timeouts())
            .unwrap();

        match &planned.steps[1].step {
            Step::UpdateService { update, .. } => {
                let config = update.deployment_configuration.unwrap();
                assert_eq!(config.maximum_percent, 200);
                assert_eq!(config.minimum_healthy_percent, 50);
                assert!(config.circuit_breaker.enable);
                assert!(config.circuit_breaker.rollback);
            }
            other => panic!("unexpected step {:?}", other),
        }

        let rollback = planned.rollback.unwrap();
        assert_eq!(rollback.steps.len(), 2);
        assert_eq!(rollback.steps[0].requires_completed, Some(1));
    }

    #[test]
    fn test_invalid_bounds() {
        let target = existing_target();
        let request = DeploymentRequest::new(ServiceKey::new("prod", "web"), Strategy::rolling());
        assert!(RollingPlanner::new(90, 50)
            .plan(&target, &request, &timeouts())
            .is_err());
        assert!(RollingPlanner::new(200, 150)
            .plan(&target, &request, &timeouts())
            .is_err());
    }

    #[test]
    fn test_no_rollback_for_new_service() {
        let target = new_target();
        let request = DeploymentRequest::new(ServiceKey::new("prod", "web"), Strategy::rolling());
        let planned = RollingPlanner::new(200, 50)
            .plan(&target, &request, &timeouts())
            .unwrap();
        assert!(planned.rollback.is_none());
        assert_eq!(planned.steps[1].step.name(), "create_service");
    }
}
