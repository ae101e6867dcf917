//! Target-tracking scaling policies

use crate::ServiceKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Utilization metric a policy tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    CpuUtilization,
    MemoryUtilization,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::CpuUtilization => f.write_str("cpu"),
            MetricKind::MemoryUtilization => f.write_str("memory"),
        }
    }
}

/// Utilization percentage to hold a metric at
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetMetric {
    pub metric: MetricKind,
    pub target: f64,
}

impl TargetMetric {
    pub fn cpu(target: f64) -> Self {
        Self {
            metric: MetricKind::CpuUtilization,
            target,
        }
    }

    pub fn memory(target: f64) -> Self {
        Self {
            metric: MetricKind::MemoryUtilization,
            target,
        }
    }
}

/// Capacity bounds, tracked metrics and cooldowns for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub targets: Vec<TargetMetric>,
    #[serde(with = "crate::duration_serde")]
    pub scale_in_cooldown: Duration,
    #[serde(with = "crate::duration_serde")]
    pub scale_out_cooldown: Duration,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min_capacity: 1,
            max_capacity: 10,
            targets: vec![TargetMetric::cpu(70.0), TargetMetric::memory(80.0)],
            scale_in_cooldown: Duration::from_secs(300),
            scale_out_cooldown: Duration::from_secs(60),
        }
    }
}

impl ScalingPolicy {
    pub fn new(min_capacity: u32, max_capacity: u32) -> Self {
        Self {
            min_capacity,
            max_capacity,
            ..Self::default()
        }
    }

    pub fn with_targets(mut self, targets: Vec<TargetMetric>) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_cooldowns(mut self, scale_in: Duration, scale_out: Duration) -> Self {
        self.scale_in_cooldown = scale_in;
        self.scale_out_cooldown = scale_out;
        self
    }

    pub fn target_for(&self, metric: MetricKind) -> Option<f64> {
        self.targets
            .iter()
            .find(|t| t.metric == metric)
            .map(|t| t.target)
    }

    /// Bound `capacity` to the policy; the maximum wins if the bounds are inverted
    pub fn clamp(&self, capacity: u32) -> u32 {
        capacity.max(self.min_capacity).min(self.max_capacity)
    }

    pub fn validate(&self) -> Result<(), ScalingPolicyError> {
        if self.min_capacity > self.max_capacity {
            return Err(ScalingPolicyError::MinExceedsMax {
                min: self.min_capacity,
                max: self.max_capacity,
            });
        }
        if self.targets.is_empty() {
            return Err(ScalingPolicyError::NoTargets);
        }
        for target in &self.targets {
            if !target.target.is_finite() || target.target <= 0.0 || target.target > 100.0 {
                return Err(ScalingPolicyError::TargetOutOfRange {
                    metric: target.metric,
                    target: target.target,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScalingPolicyError {
    #[error("min capacity {min} exceeds max capacity {max}")]
    MinExceedsMax { min: u32, max: u32 },

    #[error("policy tracks no metrics")]
    NoTargets,

    #[error("{metric} target {target} is outside (0, 100]")]
    TargetOutOfRange { metric: MetricKind, target: f64 },
}

/// Direction of a capacity change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Out,
    In,
}

/// A point-in-time reading of one metric for one service
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric: MetricKind,
    /// Average utilization percentage across running tasks
    pub value: f64,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Capacity change decided by the policy engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub key: ServiceKey,
    pub from: u32,
    pub to: u32,
    pub direction: ScaleDirection,
    /// Metric that produced the winning capacity
    pub driven_by: MetricKind,
    pub at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        let policy = ScalingPolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.target_for(MetricKind::CpuUtilization), Some(70.0));
        assert_eq!(policy.target_for(MetricKind::MemoryUtilization), Some(80.0));
        assert_eq!(policy.scale_in_cooldown, Duration::from_secs(300));
        assert_eq!(policy.scale_out_cooldown, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_policies() {
        assert!(matches!(
            ScalingPolicy::new(5, 2).validate(),
            Err(ScalingPolicyError::MinExceedsMax { min: 5, max: 2 })
        ));
        assert!(matches!(
            ScalingPolicy::new(1, 4)
                .with_targets(vec![TargetMetric::cpu(0.0)])
                .validate(),
            Err(ScalingPolicyError::TargetOutOfRange { .. })
        ));
        assert!(matches!(
            ScalingPolicy::new(1, 4)
                .with_targets(vec![TargetMetric::memory(120.0)])
                .validate(),
            Err(ScalingPolicyError::TargetOutOfRange { .. })
        ));
        assert_eq!(
            ScalingPolicy::new(1, 4).with_targets(vec![]).validate(),
            Err(ScalingPolicyError::NoTargets)
        );
    }

    #[test]
    fn test_clamp() {
        let policy = ScalingPolicy::new(2, 6);
        assert_eq!(policy.clamp(0), 2);
        assert_eq!(policy.clamp(4), 4);
        assert_eq!(policy.clamp(40), 6);
    }

    #[test]
    fn test_clamp_with_inverted_bounds_does_not_panic() {
        let policy = ScalingPolicy::new(6, 2);
        assert_eq!(policy.clamp(0), 2);
        assert_eq!(policy.clamp(4), 2);
    }
}
