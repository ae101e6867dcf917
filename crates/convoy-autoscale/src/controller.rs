//! Autoscaling controller
//!
//! Periodically evaluates every registered service: describe the service,
//! read its metrics, ask the engine, and apply the new desired count with
//! UpdateService.

use crate::engine::ScalingEngine;
use crate::error::{AutoscaleError, Result};
use chrono::{DateTime, Utc};
use convoy_platform::{PlatformClient, RetryPolicy, UpdateServiceInput};
use convoy_types::{
    ControlPlaneContext, ConvoyEvent, ConvoyEventEnvelope, EventSource, ScaleRequest,
    ScalingPolicy, ServiceKey,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscaleConfig {
    /// Interval between evaluation rounds
    #[serde(with = "convoy_types::duration_serde")]
    pub interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Applies target-tracking policies to registered services
pub struct AutoscaleController {
    platform: Arc<dyn PlatformClient>,
    engine: ScalingEngine,
    policies: DashMap<ServiceKey, ScalingPolicy>,
    config: AutoscaleConfig,
    event_tx: broadcast::Sender<ConvoyEventEnvelope>,
    context: ControlPlaneContext,
}

impl AutoscaleController {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        config: AutoscaleConfig,
        event_tx: broadcast::Sender<ConvoyEventEnvelope>,
        context: ControlPlaneContext,
    ) -> Self {
        Self {
            platform,
            engine: ScalingEngine::new(),
            policies: DashMap::new(),
            config,
            event_tx,
            context,
        }
    }

    /// Validate a policy, attach it on the platform and start tracking it
    #[instrument(skip(self, policy), fields(service = %key))]
    pub async fn register(&self, key: ServiceKey, policy: ScalingPolicy) -> Result<()> {
        policy.validate()?;

        let platform = self.platform.as_ref();
        let (target, attached) = (&key, &policy);
        let (result, _) = self
            .config
            .retry
            .run("put_scaling_policy", move || {
                platform.put_scaling_policy(target, attached)
            })
            .await;
        result?;

        info!(
            min = policy.min_capacity,
            max = policy.max_capacity,
            "Scaling policy registered"
        );
        self.policies.insert(key.clone(), policy);
        self.emit_event(ConvoyEvent::ScalingPolicyRegistered { service: key });
        Ok(())
    }

    /// Stop tracking a service
    pub fn deregister(&self, key: &ServiceKey) -> Result<ScalingPolicy> {
        let (_, policy) = self
            .policies
            .remove(key)
            .ok_or_else(|| AutoscaleError::NotRegistered(key.clone()))?;
        self.engine.reset(key);
        Ok(policy)
    }

    pub fn policy(&self, key: &ServiceKey) -> Option<ScalingPolicy> {
        self.policies.get(key).map(|p| p.clone())
    }

    pub fn registered(&self) -> Vec<ServiceKey> {
        self.policies.iter().map(|p| p.key().clone()).collect()
    }

    /// One evaluation round at the current time
    pub async fn tick(&self) -> Vec<ScaleRequest> {
        self.tick_at(Utc::now()).await
    }

    /// One evaluation round as of `now`; returns the changes that were applied
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Vec<ScaleRequest> {
        let tracked: Vec<(ServiceKey, ScalingPolicy)> = self
            .policies
            .iter()
            .map(|p| (p.key().clone(), p.value().clone()))
            .collect();

        let mut applied = Vec::new();
        for (key, policy) in tracked {
            match self.evaluate_service(&key, &policy, now).await {
                Ok(Some(request)) => applied.push(request),
                Ok(None) => {}
                Err(e) => {
                    warn!(service = %key, error = %e, "Autoscaling evaluation failed");
                    self.emit_event(ConvoyEvent::ScalingFailed {
                        service: key,
                        reason: e.to_string(),
                    });
                }
            }
        }
        applied
    }

    async fn evaluate_service(
        &self,
        key: &ServiceKey,
        policy: &ScalingPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<ScaleRequest>> {
        let platform = self.platform.as_ref();
        let retry = &self.config.retry;

        let (record, _) = retry
            .run("describe_service", move || platform.describe_service(key))
            .await;
        let record = record?;
        if !record.exists {
            debug!(service = %key, "Service absent, skipping");
            return Ok(None);
        }
        if record.has_deployment_in_flight() {
            debug!(service = %key, "Deployment in flight, skipping");
            return Ok(None);
        }

        let mut samples = Vec::with_capacity(policy.targets.len());
        for target in &policy.targets {
            let metric = target.metric;
            let (sample, _) = retry
                .run("describe_metric", move || platform.describe_metric(key, metric))
                .await;
            if let Some(sample) = sample? {
                samples.push(sample);
            }
        }

        let request = match self.engine.evaluate(&record, policy, &samples, now) {
            Some(request) => request,
            None => return Ok(None),
        };

        let input = &UpdateServiceInput::desired_count(request.to);
        let (updated, _) = retry
            .run("update_service", move || platform.update_service(key, input))
            .await;
        updated?;
        self.engine.record(key, request.direction, request.at);

        info!(
            service = %key,
            from = request.from,
            to = request.to,
            metric = %request.driven_by,
            "Service scaled"
        );
        self.emit_event(ConvoyEvent::ServiceScaled {
            service: key.clone(),
            from: request.from,
            to: request.to,
            direction: request.direction,
            metric: request.driven_by,
        });
        Ok(Some(request))
    }

    /// Evaluate every `interval` until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval.as_secs(), "Autoscaler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let applied = self.tick().await;
                    if !applied.is_empty() {
                        debug!(changes = applied.len(), "Autoscaling round applied changes");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Autoscaler stopped");
    }

    fn emit_event(&self, event: ConvoyEvent) {
        let envelope = ConvoyEventEnvelope::new(event, EventSource::Autoscaler, &self.context);
        let _ = self.event_tx.send(envelope);
    }
}
