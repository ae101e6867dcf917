//! Convoy Types - Core types for the deployment control plane
//!
//! Convoy computes and executes safe state transitions for containerized
//! services on a managed container platform. This crate holds the data model
//! every other Convoy crate speaks.
//!
//! ## Key Concepts
//!
//! - **TaskSpec**: Immutable description of a task-definition revision
//! - **ServiceRecord**: What the platform currently runs for a service
//! - **DeploymentRequest**: Desired state plus the strategy to reach it
//! - **DeploymentPlan**: Ordered, guarded platform steps with a rollback plan
//! - **ScalingPolicy**: Target-tracking capacity bounds
//! - **ScheduleEntry**: Recurring deployment or batch run
//! - **Events**: Unified observability stream

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod context;
pub mod events;
pub mod ids;
pub mod plan;
pub mod request;
pub mod scaling;
pub mod schedule;
pub mod service;
pub mod task;

// Re-export main types
pub use context::{ControlPlaneContext, TaskDefaults};
pub use events::{ConvoyEvent, ConvoyEventEnvelope, EventSeverity, EventSource};
pub use ids::{
    ClusterId, DeploymentId, RevisionParseError, ScheduleEntryId, ServiceId, ServiceKey, TaskId,
    TaskDefinitionRevision,
};
pub use plan::{
    CircuitBreakerConfig, DeploymentConfiguration, DeploymentPlan, DeploymentState, Guard,
    PlanStep, RevisionRef, RollbackPlan, ServiceDefinition, ServiceUpdate, Step, StepOutcome,
    StepStatus,
};
pub use request::{
    DeploymentParams, DeploymentRequest, Strategy, StrategyKind, TrafficShift,
    DEFAULT_APPROVAL_TIMEOUT, DEFAULT_MAX_PERCENT, DEFAULT_MIN_HEALTHY_PERCENT,
    DEFAULT_STABLE_TIMEOUT,
};
pub use scaling::{
    MetricKind, MetricSample, ScaleDirection, ScaleRequest, ScalingPolicy, ScalingPolicyError,
    TargetMetric,
};
pub use schedule::{BatchRun, ScheduleEntry, ScheduleTarget};
pub use service::{RolloutState, ServiceRecord};
pub use task::{
    ContainerDependency, ContainerSpec, DependencyCondition, HealthCheck, PortMapping, Protocol,
    ResourceReservation, TaskSpec, TaskSpecError, DEFAULT_CONTAINER_PORT, DEFAULT_TASK_CPU,
    DEFAULT_TASK_MEMORY,
};

/// Serde helper for Duration, encoded as milliseconds
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
