//! Strategy Selector
//!
//! Turns a resolved target state into a [`DeploymentPlan`] using the planner
//! for the requested strategy, then inserts the manual approval gate.

use crate::error::Result;
use crate::resolver::TargetState;
use crate::strategies::{create_planner, StepTimeouts};
use convoy_types::{DeploymentPlan, DeploymentRequest, PlanStep, Step};
use std::time::Duration;
use tracing::debug;

/// Default timeout for a single platform call step
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct StrategySelector {
    step_timeout: Duration,
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_TIMEOUT)
    }
}

impl StrategySelector {
    pub fn new(step_timeout: Duration) -> Self {
        Self { step_timeout }
    }

    pub fn plan(&self, target: &TargetState, request: &DeploymentRequest) -> Result<DeploymentPlan> {
        let planner = create_planner(&request.strategy);
        let timeouts = StepTimeouts {
            step: self.step_timeout,
            stable: request.params.stable_timeout,
        };

        let mut planned = planner.plan(target, request, &timeouts)?;

        if request.params.require_approval && planner.allows_approval_gate() {
            if let Some(at) = planned.steps.iter().position(|s| s.step.is_mutating()) {
                let gate = PlanStep::new(
                    Step::ManualApprovalGate {
                        timeout: request.params.approval_timeout,
                    },
                    request.params.approval_timeout,
                );
                planned.steps.insert(at, gate);

                // Rollback markers point at forward indices, which shifted by one
                if let Some(rollback) = planned.rollback.as_mut() {
                    for step in &mut rollback.steps {
                        if let Some(index) = step.requires_completed.as_mut() {
                            if *index >= at {
                                *index += 1;
                            }
                        }
                    }
                }
            }
        }

        let plan = DeploymentPlan {
            id: request.id.clone(),
            key: request.key.clone(),
            strategy: request.strategy.kind(),
            steps: planned.steps,
            rollback: planned.rollback,
            created_at: chrono::Utc::now(),
        };

        debug!(
            deployment_id = %plan.id,
            strategy = planner.name(),
            steps = ?plan.step_names(),
            "Plan built"
        );

        Ok(plan)
    }
}
