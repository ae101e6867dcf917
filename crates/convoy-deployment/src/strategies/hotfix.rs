//! Hotfix deployment strategy

use super::{deploy, register, revision_update, wait, PlannedSteps, StepPlanner, StepTimeouts};
use crate::error::Result;
use crate::resolver::TargetState;
use convoy_types::{DeploymentRequest, RevisionRef};

/// Emergency image replacement.
///
/// The resolver has already applied the image override; this forces a new
/// deployment and never waits for a human.
pub struct HotfixPlanner;

impl StepPlanner for HotfixPlanner {
    fn plan(
        &self,
        target: &TargetState,
        _request: &DeploymentRequest,
        timeouts: &StepTimeouts,
    ) -> Result<PlannedSteps> {
        let mut update = revision_update(target, RevisionRef::Registered, None);
        update.force_new_deployment = true;

        Ok(PlannedSteps {
            steps: vec![
                register(target, timeouts),
                deploy(target, update, timeouts),
                wait(&target.key, timeouts),
            ],
            rollback: None,
        })
    }

    fn name(&self) -> &str {
        "hotfix"
    }

    fn allows_approval_gate(&self) -> bool {
        false
    }
}
