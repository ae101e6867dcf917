//! Event types for Convoy observability
//!
//! Deployment, autoscaling and scheduling activity is published as one
//! stream of enveloped events.

use crate::{
    ControlPlaneContext, DeploymentId, MetricKind, ScaleDirection, ScheduleEntryId, ServiceKey,
    StrategyKind, TaskDefinitionRevision,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all Convoy events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvoyEventEnvelope {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Event source
    pub source: EventSource,

    /// Event severity
    pub severity: EventSeverity,

    /// Project the control plane serves
    pub project: String,

    /// Correlation ID for tracing
    pub correlation_id: Option<String>,

    /// Actor who triggered the event
    pub actor: Option<String>,

    /// The actual event
    pub event: ConvoyEvent,
}

/// Event sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    /// Deployment manager
    Deployment,
    /// Plan executor
    Executor,
    /// Autoscaling controller
    Autoscaler,
    /// Schedule runner
    Scheduler,
    /// Daemon lifecycle
    Daemon,
}

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Convoy events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConvoyEvent {
    // ═══════════════════════════════════════════════════════════════════
    // DEPLOYMENT EVENTS
    // ═══════════════════════════════════════════════════════════════════
    DeploymentSubmitted {
        deployment_id: DeploymentId,
        service: ServiceKey,
        strategy: StrategyKind,
    },

    DeploymentPlanned {
        deployment_id: DeploymentId,
        steps: Vec<String>,
    },

    StepStarted {
        deployment_id: DeploymentId,
        index: usize,
        step: String,
    },

    StepCompleted {
        deployment_id: DeploymentId,
        index: usize,
        step: String,
    },

    StepFailed {
        deployment_id: DeploymentId,
        index: usize,
        step: String,
        reason: String,
    },

    /// Execution is suspended until someone approves or rejects
    ApprovalRequired {
        deployment_id: DeploymentId,
        timeout_seconds: u64,
    },

    ApprovalGranted {
        deployment_id: DeploymentId,
        approver: String,
    },

    ApprovalRejected {
        deployment_id: DeploymentId,
        approver: String,
        reason: String,
    },

    /// The platform reverted the service on its own
    CircuitBreakerTripped {
        deployment_id: DeploymentId,
        service: ServiceKey,
    },

    DeploymentSucceeded {
        deployment_id: DeploymentId,
        revision: Option<TaskDefinitionRevision>,
        duration_seconds: u64,
    },

    DeploymentFailed {
        deployment_id: DeploymentId,
        failed_step: Option<usize>,
        reason: String,
    },

    DeploymentRolledBack {
        deployment_id: DeploymentId,
        to_revision: Option<TaskDefinitionRevision>,
    },

    DeploymentExpired {
        deployment_id: DeploymentId,
    },

    // ═══════════════════════════════════════════════════════════════════
    // AUTOSCALING EVENTS
    // ═══════════════════════════════════════════════════════════════════
    ScalingPolicyRegistered {
        service: ServiceKey,
    },

    ServiceScaled {
        service: ServiceKey,
        from: u32,
        to: u32,
        direction: ScaleDirection,
        metric: MetricKind,
    },

    ScalingFailed {
        service: ServiceKey,
        reason: String,
    },

    // ═══════════════════════════════════════════════════════════════════
    // SCHEDULER EVENTS
    // ═══════════════════════════════════════════════════════════════════
    ScheduleFired {
        entry_id: ScheduleEntryId,
        minute: chrono::DateTime<chrono::Utc>,
    },

    ScheduleDispatchFailed {
        entry_id: ScheduleEntryId,
        minute: chrono::DateTime<chrono::Utc>,
        reason: String,
    },
}

impl ConvoyEventEnvelope {
    /// Create a new event envelope
    pub fn new(event: ConvoyEvent, source: EventSource, context: &ControlPlaneContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            source,
            severity: Self::infer_severity(&event),
            project: context.project.clone(),
            correlation_id: None,
            actor: None,
            event,
        }
    }

    /// Create with correlation ID
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Create with actor
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    fn infer_severity(event: &ConvoyEvent) -> EventSeverity {
        match event {
            ConvoyEvent::DeploymentFailed { .. }
            | ConvoyEvent::StepFailed { .. }
            | ConvoyEvent::ScalingFailed { .. }
            | ConvoyEvent::ScheduleDispatchFailed { .. } => EventSeverity::Error,

            ConvoyEvent::DeploymentRolledBack { .. }
            | ConvoyEvent::CircuitBreakerTripped { .. }
            | ConvoyEvent::DeploymentExpired { .. }
            | ConvoyEvent::ApprovalRejected { .. } => EventSeverity::Warning,

            ConvoyEvent::StepStarted { .. } | ConvoyEvent::StepCompleted { .. } => {
                EventSeverity::Debug
            }

            _ => EventSeverity::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_inference() {
        let ctx = ControlPlaneContext::default();
        let failed = ConvoyEventEnvelope::new(
            ConvoyEvent::DeploymentFailed {
                deployment_id: DeploymentId::generate(),
                failed_step: Some(2),
                reason: "timeout".into(),
            },
            EventSource::Executor,
            &ctx,
        );
        assert_eq!(failed.severity, EventSeverity::Error);

        let tripped = ConvoyEventEnvelope::new(
            ConvoyEvent::CircuitBreakerTripped {
                deployment_id: DeploymentId::generate(),
                service: ServiceKey::new("prod", "web"),
            },
            EventSource::Executor,
            &ctx,
        );
        assert_eq!(tripped.severity, EventSeverity::Warning);
    }

    #[test]
    fn test_envelope_builders() {
        let ctx = ControlPlaneContext::default();
        let env = ConvoyEventEnvelope::new(
            ConvoyEvent::ScalingPolicyRegistered {
                service: ServiceKey::new("prod", "web"),
            },
            EventSource::Autoscaler,
            &ctx,
        )
        .with_correlation("corr-1")
        .with_actor("ops@example.com");

        assert_eq!(env.project, "convoy");
        assert_eq!(env.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(env.actor.as_deref(), Some("ops@example.com"));
        assert_eq!(env.severity, EventSeverity::Info);
    }
}
