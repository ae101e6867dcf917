//! Blue-Green deployment strategy

use super::{register, wait, PlannedSteps, StepPlanner, StepTimeouts};
use crate::error::{DeploymentError, Result};
use crate::resolver::TargetState;
use convoy_types::{
    DeploymentConfiguration, DeploymentRequest, Guard, PlanStep, RevisionRef, RollbackPlan,
    ServiceDefinition, ServiceId, ServiceKey, Step, TrafficShift,
};
use tracing::debug;

/// Blue-Green deployment planner
///
/// Brings up a parallel green service on its own target group, moves the
/// listener over once green is stable, then removes blue.
pub struct BlueGreenPlanner {
    traffic: TrafficShift,
    green_service: Option<ServiceId>,
}

impl BlueGreenPlanner {
    pub fn new(traffic: TrafficShift, green_service: Option<ServiceId>) -> Self {
        Self {
            traffic,
            green_service,
        }
    }

    fn green_key(&self, blue: &ServiceKey) -> ServiceKey {
        ServiceKey {
            cluster: blue.cluster.clone(),
            service: self
                .green_service
                .clone()
                .unwrap_or_else(|| blue.service.green()),
        }
    }
}

// Forward step indices referenced by the rollback plan
const CREATE_GREEN: usize = 1;
const SWITCH_TRAFFIC: usize = 3;

impl StepPlanner for BlueGreenPlanner {
    fn plan(
        &self,
        target: &TargetState,
        _request: &DeploymentRequest,
        timeouts: &StepTimeouts,
    ) -> Result<PlannedSteps> {
        if self.traffic.blue_target_group == self.traffic.green_target_group {
            return Err(DeploymentError::InvalidSpec(format!(
                "blue and green share target group '{}'",
                self.traffic.blue_target_group
            )));
        }

        let blue = target.key.clone();
        let green = self.green_key(&blue);
        if green == blue {
            return Err(DeploymentError::InvalidSpec(format!(
                "green service must differ from {}",
                blue
            )));
        }
        debug!(blue = %blue, green = %green, "Planning blue/green cut-over");

        let steps = vec![
            register(target, timeouts),
            PlanStep::new(
                Step::CreateService {
                    service: ServiceDefinition {
                        key: green.clone(),
                        revision: RevisionRef::Registered,
                        desired_count: target.desired_count,
                        deployment_configuration: DeploymentConfiguration::default(),
                        enable_execute_command: target.task_spec.enable_execute_command,
                        target_group: Some(self.traffic.green_target_group.clone()),
                    },
                },
                timeouts.step,
            )
            .guarded(Guard::ServiceAbsent(green.clone())),
            wait(&green, timeouts),
            PlanStep::new(
                Step::SwitchTraffic {
                    listener: self.traffic.listener.clone(),
                    from_target_group: self.traffic.blue_target_group.clone(),
                    to_target_group: self.traffic.green_target_group.clone(),
                },
                timeouts.step,
            )
            .guarded(Guard::TrafficOn {
                listener: self.traffic.listener.clone(),
                target_group: self.traffic.blue_target_group.clone(),
            }),
            wait(&green, timeouts),
            PlanStep::new(
                Step::DeregisterOld {
                    key: blue.clone(),
                    revision: target.current_revision.clone(),
                },
                timeouts.step,
            )
            .guarded(Guard::ServiceExists(blue)),
        ];

        let rollback = RollbackPlan {
            steps: vec![
                PlanStep::new(
                    Step::SwitchTraffic {
                        listener: self.traffic.listener.clone(),
                        from_target_group: self.traffic.green_target_group.clone(),
                        to_target_group: self.traffic.blue_target_group.clone(),
                    },
                    timeouts.step,
                )
                .only_if_completed(SWITCH_TRAFFIC),
                PlanStep::new(
                    Step::DeregisterOld {
                        key: green,
                        revision: None,
                    },
                    timeouts.step,
                )
                .only_if_completed(CREATE_GREEN),
            ],
        };

        Ok(PlannedSteps {
            steps,
            rollback: Some(rollback),
        })
    }

    fn name(&self) -> &str {
        "blue_green"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::fixtures::*;
    use convoy_types::Strategy;

    fn traffic(blue: &str, green: &str) -> TrafficShift {
        TrafficShift {
            listener: "listener-80".into(),
            blue_target_group: blue.into(),
            green_target_group: green.into(),
        }
    }

    fn request(shift: TrafficShift) -> DeploymentRequest {
        DeploymentRequest::new(
            ServiceKey::new("prod", "web"),
            Strategy::BlueGreen {
                traffic: shift,
                green_service: None,
            },
        )
    }

    #[test]
    fn test_blue_green_steps() {
        let shift = traffic("tg-blue", "tg-green");
        let planned = BlueGreenPlanner::new(shift.clone(), None)
            .plan(&existing_target(), &request(shift), &timeouts())
            .unwrap();

        let names: Vec<_> = planned.steps.iter().map(|s| s.step.name()).collect();
        assert_eq!(
            names,
            vec![
                "register_task_definition",
                "create_service",
                "wait_for_stable",
                "switch_traffic",
                "wait_for_stable",
                "deregister_old",
            ]
        );

        match &planned.steps[1].step {
            Step::CreateService { service } => {
                assert_eq!(service.key, ServiceKey::new("prod", "web-green"));
                assert_eq!(service.target_group.as_deref(), Some("tg-green"));
            }
            other => panic!("unexpected step {:?}", other),
        }

        let rollback = planned.rollback.unwrap();
        assert_eq!(rollback.steps[0].requires_completed, Some(SWITCH_TRAFFIC));
        assert_eq!(rollback.steps[1].requires_completed, Some(CREATE_GREEN));
    }

    #[test]
    fn test_identical_target_groups_rejected() {
        let shift = traffic("tg-1", "tg-1");
        let result = BlueGreenPlanner::new(shift.clone(), None).plan(
            &existing_target(),
            &request(shift),
            &timeouts(),
        );
        assert!(matches!(result, Err(DeploymentError::InvalidSpec(_))));
    }
}
