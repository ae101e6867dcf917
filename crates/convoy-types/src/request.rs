//! Deployment requests and strategies
//!
//! A DeploymentRequest is the immutable input of one deployment. Its Strategy
//! carries the parameters that only make sense for that strategy.

use crate::{DeploymentId, ScalingPolicy, ServiceId, ServiceKey, TaskDefinitionRevision, TaskSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Default rolling-update upper bound on running tasks (percent of desired)
pub const DEFAULT_MAX_PERCENT: u32 = 200;

/// Default rolling-update lower bound on healthy tasks (percent of desired)
pub const DEFAULT_MIN_HEALTHY_PERCENT: u32 = 50;

/// Default time to wait for a manual approval
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Default time to wait for a service to reach steady state
pub const DEFAULT_STABLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Listener and target groups involved in a blue/green cut-over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficShift {
    pub listener: String,
    pub blue_target_group: String,
    pub green_target_group: String,
}

/// How a deployment moves the service to its new state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    /// Replace the revision and wait for steady state
    Normal,

    /// Platform rolling update bounded by running/healthy percentages
    Rolling {
        #[serde(default = "default_max_percent")]
        max_percent: u32,
        #[serde(default = "default_min_healthy_percent")]
        min_healthy_percent: u32,
    },

    /// Parallel green service, then a listener switch
    BlueGreen {
        traffic: TrafficShift,
        /// Name of the parallel service; defaults to `<service>-green`
        #[serde(default)]
        green_service: Option<ServiceId>,
    },

    /// Emergency image replacement, forcing a new deployment
    Hotfix {
        image: String,
        #[serde(default)]
        container: Option<String>,
    },

    /// Point the service back at an earlier revision
    Rollback {
        #[serde(default)]
        target_revision: Option<TaskDefinitionRevision>,
    },

    /// Environment and sizing change without a new image
    ConfigChange {
        #[serde(default)]
        environment: BTreeMap<String, String>,
        #[serde(default)]
        container: Option<String>,
    },

    /// One-shot task run instead of a long-running service
    ScheduledBatch {
        #[serde(default = "default_one")]
        count: u32,
        #[serde(default = "default_one")]
        attempts: u32,
    },
}

fn default_max_percent() -> u32 {
    DEFAULT_MAX_PERCENT
}

fn default_min_healthy_percent() -> u32 {
    DEFAULT_MIN_HEALTHY_PERCENT
}

fn default_one() -> u32 {
    1
}

impl Strategy {
    /// Rolling update with the default bounds
    pub fn rolling() -> Self {
        Strategy::Rolling {
            max_percent: DEFAULT_MAX_PERCENT,
            min_healthy_percent: DEFAULT_MIN_HEALTHY_PERCENT,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Normal => StrategyKind::Normal,
            Strategy::Rolling { .. } => StrategyKind::Rolling,
            Strategy::BlueGreen { .. } => StrategyKind::BlueGreen,
            Strategy::Hotfix { .. } => StrategyKind::Hotfix,
            Strategy::Rollback { .. } => StrategyKind::Rollback,
            Strategy::ConfigChange { .. } => StrategyKind::ConfigChange,
            Strategy::ScheduledBatch { .. } => StrategyKind::ScheduledBatch,
        }
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Normal
    }
}

/// Field-less discriminant of [`Strategy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Normal,
    Rolling,
    BlueGreen,
    Hotfix,
    Rollback,
    ConfigChange,
    ScheduledBatch,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::Normal => "normal",
            StrategyKind::Rolling => "rolling",
            StrategyKind::BlueGreen => "blue_green",
            StrategyKind::Hotfix => "hotfix",
            StrategyKind::Rollback => "rollback",
            StrategyKind::ConfigChange => "config_change",
            StrategyKind::ScheduledBatch => "scheduled_batch",
        };
        f.write_str(name)
    }
}

/// Parameters shared by every strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentParams {
    /// Suspend for a human decision before the first mutating step
    #[serde(default)]
    pub require_approval: bool,

    #[serde(with = "crate::duration_serde", default = "default_approval_timeout")]
    pub approval_timeout: Duration,

    #[serde(with = "crate::duration_serde", default = "default_stable_timeout")]
    pub stable_timeout: Duration,
}

fn default_approval_timeout() -> Duration {
    DEFAULT_APPROVAL_TIMEOUT
}

fn default_stable_timeout() -> Duration {
    DEFAULT_STABLE_TIMEOUT
}

impl Default for DeploymentParams {
    fn default() -> Self {
        Self {
            require_approval: false,
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
            stable_timeout: DEFAULT_STABLE_TIMEOUT,
        }
    }
}

/// A request to move one service to a new desired state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub id: DeploymentId,

    pub key: ServiceKey,

    /// Target task spec; omitted fields inherit from the running revision
    #[serde(default = "TaskSpec::inherit")]
    pub task: TaskSpec,

    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default)]
    pub params: DeploymentParams,

    #[serde(default)]
    pub desired_count: Option<u32>,

    #[serde(default)]
    pub scaling_policy: Option<ScalingPolicy>,

    #[serde(default)]
    pub requested_by: Option<String>,

    pub submitted_at: chrono::DateTime<chrono::Utc>,
}

impl DeploymentRequest {
    pub fn new(key: ServiceKey, strategy: Strategy) -> Self {
        Self {
            id: DeploymentId::generate(),
            key,
            task: TaskSpec::inherit(),
            strategy,
            params: DeploymentParams::default(),
            desired_count: None,
            scaling_policy: None,
            requested_by: None,
            submitted_at: chrono::Utc::now(),
        }
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.task = task;
        self
    }

    pub fn with_desired_count(mut self, count: u32) -> Self {
        self.desired_count = Some(count);
        self
    }

    pub fn with_scaling_policy(mut self, policy: ScalingPolicy) -> Self {
        self.scaling_policy = Some(policy);
        self
    }

    pub fn with_approval(mut self, timeout: Duration) -> Self {
        self.params.require_approval = true;
        self.params.approval_timeout = timeout;
        self
    }

    pub fn with_stable_timeout(mut self, timeout: Duration) -> Self {
        self.params.stable_timeout = timeout;
        self
    }

    pub fn requested_by(mut self, actor: impl Into<String>) -> Self {
        self.requested_by = Some(actor.into());
        self
    }

    /// A copy of this request with a fresh id and submission time.
    ///
    /// Used when a template request is submitted repeatedly.
    pub fn reissue(&self) -> Self {
        Self {
            id: DeploymentId::generate(),
            submitted_at: chrono::Utc::now(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_tagged_serde() {
        let json = r#"{"type":"rolling"}"#;
        let strategy: Strategy = serde_json::from_str(json).unwrap();
        assert_eq!(strategy, Strategy::rolling());

        let json = r#"{"type":"rollback","target_revision":"app:7"}"#;
        let strategy: Strategy = serde_json::from_str(json).unwrap();
        assert_eq!(
            strategy,
            Strategy::Rollback {
                target_revision: Some(TaskDefinitionRevision::new("app", 7))
            }
        );
    }

    #[test]
    fn test_request_defaults_from_minimal_json() {
        let json = r#"{
            "id": "5f0c6a52-8a43-4c07-9c3b-1a8d4f3c2b10",
            "key": {"cluster": "prod", "service": "web"},
            "strategy": {"type": "hotfix", "image": "app:v2-fix"},
            "submitted_at": "2026-01-01T00:00:00Z"
        }"#;
        let request: DeploymentRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.strategy.kind(), StrategyKind::Hotfix);
        assert!(!request.params.require_approval);
        assert_eq!(request.params.approval_timeout, DEFAULT_APPROVAL_TIMEOUT);
        assert!(request.task.family.is_empty());
        assert!(request.task.containers.is_empty());
    }

    #[test]
    fn test_reissue_changes_identity_only() {
        let request = DeploymentRequest::new(ServiceKey::new("prod", "web"), Strategy::Normal)
            .with_desired_count(4);
        let again = request.reissue();
        assert_ne!(again.id, request.id);
        assert_eq!(again.key, request.key);
        assert_eq!(again.desired_count, Some(4));
    }
}
