//! Configuration change strategy

use super::{deploy, register, revision_update, wait, PlannedSteps, StepPlanner, StepTimeouts};
use crate::error::Result;
use crate::resolver::TargetState;
use convoy_types::{DeploymentRequest, RevisionRef, ServiceUpdate};

/// Environment or sizing change.
///
/// Registers a new revision only when the task-level definition changed;
/// a pure desired-count change is a single UpdateService.
pub struct ConfigChangePlanner;

impl StepPlanner for ConfigChangePlanner {
    fn plan(
        &self,
        target: &TargetState,
        _request: &DeploymentRequest,
        timeouts: &StepTimeouts,
    ) -> Result<PlannedSteps> {
        let mut steps = Vec::with_capacity(3);

        let update = if target.definition_changed || !target.service_exists {
            steps.push(register(target, timeouts));
            revision_update(target, RevisionRef::Registered, None)
        } else {
            ServiceUpdate::desired_count(target.desired_count)
        };

        steps.push(deploy(target, update, timeouts));
        steps.push(wait(&target.key, timeouts));

        Ok(PlannedSteps {
            steps,
            rollback: None,
        })
    }

    fn name(&self) -> &str {
        "config_change"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::fixtures::*;
    use convoy_types::{ServiceKey, Step, Strategy};
    use std::collections::BTreeMap;

    fn request() -> DeploymentRequest {
        DeploymentRequest::new(
            ServiceKey::new("prod", "web"),
            Strategy::ConfigChange {
                environment: BTreeMap::new(),
                container: None,
            },
        )
    }

    #[test]
    fn test_registers_when_definition_changed() {
        let planned = ConfigChangePlanner
            .plan(&existing_target(), &request(), &timeouts())
            .unwrap();
        assert_eq!(planned.steps[0].step.name(), "register_task_definition");
        assert_eq!(planned.steps.len(), 3);
    }

    #[test]
    fn test_count_only_skips_register() {
        let mut target = existing_target();
        target.definition_changed = false;
        target.desired_count = 6;

        let planned = ConfigChangePlanner
            .plan(&target, &request(), &timeouts())
            .unwrap();
        assert_eq!(planned.steps.len(), 2);
        match &planned.steps[0].step {
            Step::UpdateService { update, .. } => {
                assert_eq!(update.revision, None);
                assert_eq!(update.desired_count, Some(6));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }
}
