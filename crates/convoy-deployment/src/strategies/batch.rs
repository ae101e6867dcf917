//! Scheduled batch runs

use super::{register, PlannedSteps, StepPlanner, StepTimeouts};
use crate::error::{DeploymentError, Result};
use crate::resolver::TargetState;
use convoy_types::{DeploymentRequest, PlanStep, RevisionRef, Step};

/// Registers the task and runs it to completion; there is no service to wait on.
pub struct ScheduledBatchPlanner {
    count: u32,
    attempts: u32,
}

impl ScheduledBatchPlanner {
    pub fn new(count: u32, attempts: u32) -> Self {
        Self { count, attempts }
    }
}

impl StepPlanner for ScheduledBatchPlanner {
    fn plan(
        &self,
        target: &TargetState,
        _request: &DeploymentRequest,
        timeouts: &StepTimeouts,
    ) -> Result<PlannedSteps> {
        if self.count == 0 {
            return Err(DeploymentError::InvalidSpec(
                "batch run count must be at least 1".to_string(),
            ));
        }

        Ok(PlannedSteps {
            steps: vec![
                register(target, timeouts),
                PlanStep::new(
                    Step::RunTaskOnce {
                        cluster: target.key.cluster.clone(),
                        job_name: target.key.service.to_string(),
                        revision: RevisionRef::Registered,
                        count: self.count,
                        attempts: self.attempts.max(1),
                    },
                    timeouts.stable,
                ),
            ],
            rollback: None,
        })
    }

    fn name(&self) -> &str {
        "scheduled_batch"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::fixtures::*;
    use convoy_types::{ServiceKey, Strategy};

    #[test]
    fn test_batch_has_no_wait() {
        let request = DeploymentRequest::new(
            ServiceKey::new("batch", "image-scan"),
            Strategy::ScheduledBatch {
                count: 1,
                attempts: 0,
            },
        );
        let planned = ScheduledBatchPlanner::new(1, 0)
            .plan(&new_target(), &request, &timeouts())
            .unwrap();

        let names: Vec<_> = planned.steps.iter().map(|s| s.step.name()).collect();
        assert_eq!(names, vec!["register_task_definition", "run_task_once"]);
        match &planned.steps[1].step {
            Step::RunTaskOnce { attempts, .. } => assert_eq!(*attempts, 1),
            other => panic!("unexpected step {:?}", other),
        }
    }
}
