//! Platform client contract
//!
//! Every interaction with the container platform goes through
//! [`PlatformClient`]. Calls are at-least-once: the executor may repeat any of
//! them after a transient failure, so implementations must tolerate retries.

use crate::error::Result;
use async_trait::async_trait;
use convoy_types::{
    ClusterId, DeploymentConfiguration, MetricKind, MetricSample, ScalingPolicy, ServiceKey,
    ServiceRecord, TaskDefinitionRevision, TaskId, TaskSpec,
};
use serde::{Deserialize, Serialize};

/// Input of CreateService with every revision resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateServiceInput {
    pub key: ServiceKey,
    pub revision: TaskDefinitionRevision,
    pub desired_count: u32,
    pub deployment_configuration: DeploymentConfiguration,
    pub enable_execute_command: bool,
    pub target_group: Option<String>,
}

/// Input of UpdateService; `None` fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateServiceInput {
    pub revision: Option<TaskDefinitionRevision>,
    pub desired_count: Option<u32>,
    pub deployment_configuration: Option<DeploymentConfiguration>,
    pub force_new_deployment: bool,
    pub enable_execute_command: Option<bool>,
}

impl UpdateServiceInput {
    pub fn desired_count(count: u32) -> Self {
        Self {
            desired_count: Some(count),
            ..Self::default()
        }
    }
}

/// Input of RunTask
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTaskInput {
    pub cluster: ClusterId,
    pub revision: TaskDefinitionRevision,
    pub count: u32,
    /// Started-by tag, usually the job name
    pub started_by: String,
}

/// Lifecycle of a one-off task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskLifecycle {
    Pending,
    Running,
    Stopped,
}

/// Status of a one-off task as reported by DescribeTasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub last_status: TaskLifecycle,
    pub exit_code: Option<i32>,
    pub stopped_reason: Option<String>,
}

impl TaskStatus {
    pub fn is_stopped(&self) -> bool {
        self.last_status == TaskLifecycle::Stopped
    }

    pub fn succeeded(&self) -> bool {
        self.is_stopped() && self.exit_code == Some(0)
    }
}

/// Operations the control plane needs from a container platform
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Register a task definition; an identical spec returns the existing revision
    async fn register_task_definition(&self, spec: &TaskSpec) -> Result<TaskDefinitionRevision>;

    async fn describe_task_definition(&self, revision: &TaskDefinitionRevision) -> Result<TaskSpec>;

    async fn deregister_task_definition(&self, revision: &TaskDefinitionRevision) -> Result<()>;

    async fn create_service(&self, input: &CreateServiceInput) -> Result<ServiceRecord>;

    async fn update_service(
        &self,
        key: &ServiceKey,
        input: &UpdateServiceInput,
    ) -> Result<ServiceRecord>;

    async fn delete_service(&self, key: &ServiceKey) -> Result<()>;

    /// Current state of a service; a service that does not exist is reported
    /// with `exists == false` rather than as an error
    async fn describe_service(&self, key: &ServiceKey) -> Result<ServiceRecord>;

    async fn run_task(&self, input: &RunTaskInput) -> Result<Vec<TaskId>>;

    async fn describe_tasks(&self, cluster: &ClusterId, tasks: &[TaskId]) -> Result<Vec<TaskStatus>>;

    async fn put_scaling_policy(&self, key: &ServiceKey, policy: &ScalingPolicy) -> Result<()>;

    /// Latest sample of a utilization metric, if the platform has one
    async fn describe_metric(
        &self,
        key: &ServiceKey,
        metric: MetricKind,
    ) -> Result<Option<MetricSample>>;

    /// Point a listener's default action at a target group
    async fn switch_traffic(&self, listener: &str, target_group: &str) -> Result<()>;

    /// Target group a listener currently forwards to
    async fn describe_listener(&self, listener: &str) -> Result<Option<String>>;
}
