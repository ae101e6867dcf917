//! Normal deployment strategy

use super::{deploy, register, revision_update, wait, PlannedSteps, StepPlanner, StepTimeouts};
use crate::error::Result;
use crate::resolver::TargetState;
use convoy_types::{DeploymentRequest, RevisionRef};

/// Register the new revision, point the service at it, wait for steady state.
///
/// No rollback plan: the platform circuit breaker (enabled on creation) is the
/// safety net.
pub struct NormalPlanner;

impl StepPlanner for NormalPlanner {
    fn plan(
        &self,
        target: &TargetState,
        _request: &DeploymentRequest,
        timeouts: &StepTimeouts,
    ) -> Result<PlannedSteps> {
        Ok(PlannedSteps {
            steps: vec![
                register(target, timeouts),
                deploy(
                    target,
                    revision_update(target, RevisionRef::Registered, None),
                    timeouts,
                ),
                wait(&target.key, timeouts),
            ],
            rollback: None,
        })
    }

    fn name(&self) -> &str {
        "normal"
    }
}
