//! Rollback strategy

use super::{wait, PlannedSteps, StepPlanner, StepTimeouts};
use crate::error::{DeploymentError, Result};
use crate::resolver::TargetState;
use convoy_types::{DeploymentRequest, Guard, PlanStep, RevisionRef, ServiceUpdate, Step};

/// Points an existing service back at an earlier revision. Nothing is registered.
pub struct RollbackPlanner;

impl StepPlanner for RollbackPlanner {
    fn plan(
        &self,
        target: &TargetState,
        _request: &DeploymentRequest,
        timeouts: &StepTimeouts,
    ) -> Result<PlannedSteps> {
        let revision = target.rollback_to.clone().ok_or_else(|| {
            DeploymentError::MissingRequiredField("target_revision".to_string())
        })?;

        let update = ServiceUpdate {
            revision: Some(RevisionRef::Fixed(revision)),
            desired_count: Some(target.desired_count),
            ..ServiceUpdate::default()
        };

        Ok(PlannedSteps {
            steps: vec![
                PlanStep::new(
                    Step::UpdateService {
                        key: target.key.clone(),
                        update,
                    },
                    timeouts.step,
                )
                .guarded(Guard::NoDeploymentInFlight(target.key.clone())),
                wait(&target.key, timeouts),
            ],
            rollback: None,
        })
    }

    fn name(&self) -> &str {
        "rollback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::fixtures::*;
    use convoy_types::{ServiceKey, Strategy, TaskDefinitionRevision};

    #[test]
    fn test_rollback_targets_fixed_revision() {
        let mut target = existing_target();
        target.rollback_to = Some(TaskDefinitionRevision::new("app", 7));
        let request = DeploymentRequest::new(
            ServiceKey::new("prod", "web"),
            Strategy::Rollback {
                target_revision: None,
            },
        );

        let planned = RollbackPlanner.plan(&target, &request, &timeouts()).unwrap();
        assert_eq!(planned.steps.len(), 2);
        match &planned.steps[0].step {
            Step::UpdateService { update, .. } => assert_eq!(
                update.revision,
                Some(RevisionRef::Fixed(TaskDefinitionRevision::new("app", 7)))
            ),
            other => panic!("unexpected step {:?}", other),
        }
    }
}
