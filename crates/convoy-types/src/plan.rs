//! Deployment plans
//!
//! A plan is the ordered list of platform steps a strategy expands into,
//! together with guards that must hold before execution and the compensating
//! steps to run if a forward step fails.

use crate::{ClusterId, DeploymentId, ServiceKey, StrategyKind, TaskDefinitionRevision, TaskSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Which task-definition revision a step refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionRef {
    /// The revision produced by this plan's RegisterTaskDefinition step
    Registered,
    /// A revision known when the plan was built
    Fixed(TaskDefinitionRevision),
}

impl fmt::Display for RevisionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevisionRef::Registered => f.write_str("<registered>"),
            RevisionRef::Fixed(rev) => write!(f, "{}", rev),
        }
    }
}

/// Deployment circuit breaker settings forwarded to the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub enable: bool,
    pub rollback: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            rollback: true,
        }
    }
}

/// Rolling-update bounds and circuit breaker for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfiguration {
    pub maximum_percent: u32,
    pub minimum_healthy_percent: u32,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for DeploymentConfiguration {
    fn default() -> Self {
        Self {
            maximum_percent: crate::request::DEFAULT_MAX_PERCENT,
            minimum_healthy_percent: crate::request::DEFAULT_MIN_HEALTHY_PERCENT,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Attributes of a service to create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub key: ServiceKey,
    pub revision: RevisionRef,
    pub desired_count: u32,
    pub deployment_configuration: DeploymentConfiguration,
    pub enable_execute_command: bool,
    /// Target group the service registers its tasks with
    pub target_group: Option<String>,
}

/// Changes applied to an existing service; `None` leaves a field as is
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    pub revision: Option<RevisionRef>,
    pub desired_count: Option<u32>,
    pub deployment_configuration: Option<DeploymentConfiguration>,
    pub force_new_deployment: bool,
    pub enable_execute_command: Option<bool>,
}

impl ServiceUpdate {
    pub fn revision(revision: RevisionRef) -> Self {
        Self {
            revision: Some(revision),
            ..Self::default()
        }
    }

    pub fn desired_count(count: u32) -> Self {
        Self {
            desired_count: Some(count),
            ..Self::default()
        }
    }
}

/// One platform operation in a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Step {
    RegisterTaskDefinition {
        spec: TaskSpec,
    },
    CreateService {
        service: ServiceDefinition,
    },
    UpdateService {
        key: ServiceKey,
        update: ServiceUpdate,
    },
    WaitForStable {
        key: ServiceKey,
    },
    SwitchTraffic {
        listener: String,
        from_target_group: String,
        to_target_group: String,
    },
    ManualApprovalGate {
        #[serde(with = "crate::duration_serde")]
        timeout: Duration,
    },
    /// Remove a superseded service, optionally deregistering its revision
    DeregisterOld {
        key: ServiceKey,
        revision: Option<TaskDefinitionRevision>,
    },
    RunTaskOnce {
        cluster: ClusterId,
        job_name: String,
        revision: RevisionRef,
        count: u32,
        attempts: u32,
    },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::RegisterTaskDefinition { .. } => "register_task_definition",
            Step::CreateService { .. } => "create_service",
            Step::UpdateService { .. } => "update_service",
            Step::WaitForStable { .. } => "wait_for_stable",
            Step::SwitchTraffic { .. } => "switch_traffic",
            Step::ManualApprovalGate { .. } => "manual_approval_gate",
            Step::DeregisterOld { .. } => "deregister_old",
            Step::RunTaskOnce { .. } => "run_task_once",
        }
    }

    /// Steps that change what runs or what receives traffic
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Step::CreateService { .. }
                | Step::UpdateService { .. }
                | Step::SwitchTraffic { .. }
                | Step::DeregisterOld { .. }
                | Step::RunTaskOnce { .. }
        )
    }

    pub fn is_approval_gate(&self) -> bool {
        matches!(self, Step::ManualApprovalGate { .. })
    }
}

/// Precondition checked against the platform before any step runs and
/// again right before its own step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Guard {
    NoDeploymentInFlight(ServiceKey),
    ServiceAbsent(ServiceKey),
    ServiceExists(ServiceKey),
    TrafficOn {
        listener: String,
        target_group: String,
    },
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::NoDeploymentInFlight(key) => write!(f, "no deployment in flight on {}", key),
            Guard::ServiceAbsent(key) => write!(f, "service {} is absent", key),
            Guard::ServiceExists(key) => write!(f, "service {} exists", key),
            Guard::TrafficOn {
                listener,
                target_group,
            } => write!(f, "listener {} forwards to {}", listener, target_group),
        }
    }
}

/// A step with its guard, timeout and rollback precondition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step: Step,
    pub guard: Option<Guard>,
    #[serde(with = "crate::duration_serde")]
    pub timeout: Duration,
    /// Rollback steps only: run only if this forward step index completed
    pub requires_completed: Option<usize>,
}

impl PlanStep {
    pub fn new(step: Step, timeout: Duration) -> Self {
        Self {
            step,
            guard: None,
            timeout,
            requires_completed: None,
        }
    }

    pub fn guarded(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn only_if_completed(mut self, index: usize) -> Self {
        self.requires_completed = Some(index);
        self
    }
}

/// Compensating steps executed in order when a forward step fails
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub steps: Vec<PlanStep>,
}

/// Ordered, guarded steps realising one deployment request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub id: DeploymentId,
    pub key: ServiceKey,
    pub strategy: StrategyKind,
    pub steps: Vec<PlanStep>,
    pub rollback: Option<RollbackPlan>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl DeploymentPlan {
    pub fn approval_gate_count(&self) -> usize {
        self.steps.iter().filter(|s| s.step.is_approval_gate()).count()
    }

    pub fn first_mutating_index(&self) -> Option<usize> {
        self.steps.iter().position(|s| s.step.is_mutating())
    }

    pub fn guards(&self) -> impl Iterator<Item = (usize, &Guard)> {
        self.steps
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.guard.as_ref().map(|g| (i, g)))
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.step.name()).collect()
    }
}

/// Lifecycle of an executing plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeploymentState {
    Pending,
    Running,
    /// Suspended on a manual approval gate
    AwaitingApproval,
    Succeeded,
    Failed,
    RolledBack,
    /// Approval timed out before anything was changed
    Expired,
}

impl DeploymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Succeeded
                | DeploymentState::Failed
                | DeploymentState::RolledBack
                | DeploymentState::Expired
        )
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentState::Pending => "pending",
            DeploymentState::Running => "running",
            DeploymentState::AwaitingApproval => "awaiting_approval",
            DeploymentState::Succeeded => "succeeded",
            DeploymentState::Failed => "failed",
            DeploymentState::RolledBack => "rolled_back",
            DeploymentState::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// Result of a single executed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Rollback step whose forward counterpart never completed
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub step: String,
    pub status: StepStatus,
    /// Whether this outcome belongs to the rollback plan
    pub rollback: bool,
    pub attempts: u32,
    pub detail: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}
