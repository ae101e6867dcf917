//! Target-tracking policy engine
//!
//! For every tracked metric the engine computes the capacity that would bring
//! utilization back to the target, `ceil(current × value / target)`, clamps it
//! to the policy bounds and takes the largest result. Scale-out and scale-in
//! cooldowns are tracked separately per service.

use chrono::{DateTime, Utc};
use convoy_types::{
    MetricKind, MetricSample, ScaleDirection, ScaleRequest, ScalingPolicy, ServiceKey,
    ServiceRecord,
};
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

/// Absorbs float error so that an exact ratio does not round up
const CEIL_EPSILON: f64 = 1e-9;

/// Capacity one metric asks for, before clamping
pub fn desired_capacity(current: u32, value: f64, target: f64) -> u32 {
    if target <= 0.0 || !value.is_finite() || value <= 0.0 {
        return 0;
    }
    let raw = (current as f64 * value / target - CEIL_EPSILON).ceil();
    if raw <= 0.0 {
        0
    } else if raw >= u32::MAX as f64 {
        u32::MAX
    } else {
        raw as u32
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LastActions {
    scale_out: Option<DateTime<Utc>>,
    scale_in: Option<DateTime<Utc>>,
}

/// Stateful evaluator; remembers when each service last scaled
#[derive(Debug, Default)]
pub struct ScalingEngine {
    last: DashMap<ServiceKey, LastActions>,
}

impl ScalingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `service` should change capacity.
    ///
    /// Evaluation only decides. The cooldown for a direction starts when the
    /// caller reports the change as applied through [`Self::record`].
    pub fn evaluate(
        &self,
        service: &ServiceRecord,
        policy: &ScalingPolicy,
        samples: &[MetricSample],
        now: DateTime<Utc>,
    ) -> Option<ScaleRequest> {
        if let Err(e) = policy.validate() {
            debug!(service = %service.key, error = %e, "Invalid scaling policy, not evaluated");
            return None;
        }
        let current = service.desired_count;
        let (to, driven_by) = Self::target_capacity(current, policy, samples)?;

        let direction = if to > current {
            ScaleDirection::Out
        } else if to < current {
            ScaleDirection::In
        } else {
            return None;
        };

        let last = self
            .last
            .get(&service.key)
            .map(|l| *l)
            .unwrap_or_default();
        let (previous, cooldown) = match direction {
            ScaleDirection::Out => (last.scale_out, policy.scale_out_cooldown),
            ScaleDirection::In => (last.scale_in, policy.scale_in_cooldown),
        };
        if let Some(at) = previous {
            if cooling_down(at, now, cooldown) {
                debug!(
                    service = %service.key,
                    ?direction,
                    from = current,
                    to,
                    "Scaling suppressed by cooldown"
                );
                return None;
            }
        }

        Some(ScaleRequest {
            key: service.key.clone(),
            from: current,
            to,
            direction,
            driven_by,
            at: now,
        })
    }

    /// Start the cooldown for `direction` as of `at`
    pub fn record(&self, key: &ServiceKey, direction: ScaleDirection, at: DateTime<Utc>) {
        let mut last = self.last.entry(key.clone()).or_default();
        match direction {
            ScaleDirection::Out => last.scale_out = Some(at),
            ScaleDirection::In => last.scale_in = Some(at),
        }
    }

    /// Forget cooldown history, e.g. when a policy is removed
    pub fn reset(&self, key: &ServiceKey) {
        self.last.remove(key);
    }

    fn target_capacity(
        current: u32,
        policy: &ScalingPolicy,
        samples: &[MetricSample],
    ) -> Option<(u32, MetricKind)> {
        policy
            .targets
            .iter()
            .filter_map(|target| {
                let sample = samples
                    .iter()
                    .filter(|s| s.metric == target.metric)
                    .max_by_key(|s| s.at)?;
                let wanted = desired_capacity(current, sample.value, target.target);
                Some((policy.clamp(wanted), target.metric))
            })
            .max_by_key(|(capacity, _)| *capacity)
    }
}

fn cooling_down(last: DateTime<Utc>, now: DateTime<Utc>, cooldown: Duration) -> bool {
    match (now - last).to_std() {
        Ok(elapsed) => elapsed < cooldown,
        // Clock went backwards; stay conservative
        Err(_) => true,
    }
}
