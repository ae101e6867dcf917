//! Deployment Manager - Entry point for deployment operations
//!
//! The manager takes a [`DeploymentRequest`], observes the service, resolves
//! the target state, builds a plan and hands it to the executor on a
//! background task. It owns the per-service locks, the approval gates and the
//! event stream.

use crate::approval::{ApprovalDecision, ApprovalRegistry};
use crate::error::{DeploymentError, Result};
use crate::executor::{DeploymentExecutor, DeploymentResult, ExecutorConfig};
use crate::lock::ServiceLocks;
use crate::resolver::DesiredStateResolver;
use crate::selector::{StrategySelector, DEFAULT_STEP_TIMEOUT};
use crate::state::DeploymentStateStore;
use convoy_platform::PlatformClient;
use convoy_types::{
    ControlPlaneContext, ConvoyEvent, ConvoyEventEnvelope, DeploymentId, DeploymentPlan,
    DeploymentRequest, DeploymentState, EventSource, ServiceKey, TaskDefaults,
    TaskDefinitionRevision,
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub executor: ExecutorConfig,
    pub defaults: TaskDefaults,
    /// Timeout of a single platform call step
    pub step_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            defaults: TaskDefaults::default(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

/// A submitted deployment running in the background
pub struct DeploymentHandle {
    pub id: DeploymentId,
    pub plan: DeploymentPlan,
    join: JoinHandle<DeploymentResult>,
}

impl DeploymentHandle {
    /// Wait for the deployment to reach a terminal state
    pub async fn wait(self) -> Result<DeploymentResult> {
        self.join
            .await
            .map_err(|e| DeploymentError::Internal(format!("deployment task failed: {}", e)))
    }
}

/// Deployment Manager orchestrates deployments of container services
pub struct DeploymentManager {
    platform: Arc<dyn PlatformClient>,
    resolver: DesiredStateResolver,
    selector: StrategySelector,
    executor: Arc<DeploymentExecutor>,
    locks: ServiceLocks,
    approvals: Arc<ApprovalRegistry>,
    store: Arc<dyn DeploymentStateStore>,
    running: Arc<DashMap<DeploymentId, CancellationToken>>,
    event_tx: broadcast::Sender<ConvoyEventEnvelope>,
    context: ControlPlaneContext,
}

impl DeploymentManager {
    /// Create a new deployment manager
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        store: Arc<dyn DeploymentStateStore>,
        config: ManagerConfig,
        context: ControlPlaneContext,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(4096);
        let approvals = Arc::new(ApprovalRegistry::new());
        let executor = Arc::new(DeploymentExecutor::new(
            platform.clone(),
            config.executor,
            approvals.clone(),
            store.clone(),
            event_tx.clone(),
            context.clone(),
        ));

        Self {
            platform,
            resolver: DesiredStateResolver::new(config.defaults),
            selector: StrategySelector::new(config.step_timeout),
            executor,
            locks: ServiceLocks::new(),
            approvals,
            store,
            running: Arc::new(DashMap::new()),
            event_tx,
            context,
        }
    }

    /// Validate, plan and start a deployment.
    ///
    /// Fails immediately with `ConflictingDeployment` when the service
    /// already has a plan in flight; the running plan is not affected.
    #[instrument(skip(self, request), fields(deployment_id = %request.id, service = %request.key, strategy = %request.strategy.kind()))]
    pub async fn submit(&self, request: DeploymentRequest) -> Result<DeploymentHandle> {
        // 1. One plan per service
        let lock = self.locks.try_acquire(&request.key, &request.id)?;

        // 2. Observe the service
        let platform = self.platform.as_ref();
        let key = &request.key;
        let (current, _) = self
            .executor
            .config()
            .retry
            .run("describe_service", move || platform.describe_service(key))
            .await;
        let mut current = current?;

        let history = self.store.revision_history(key).await?;
        if current.previous_revision.is_none() {
            current.previous_revision = history
                .iter()
                .rev()
                .find(|rev| Some(*rev) != current.current_revision.as_ref())
                .cloned();
        }
        if let Some(revision) = &current.current_revision {
            self.store.record_revision(key, revision).await?;
        }

        // 3. Resolve and plan
        let target = self.resolver.resolve(&current, &request)?;
        let plan = self.selector.plan(&target, &request)?;
        self.store.save_plan(&plan).await?;

        let mut submitted = ConvoyEventEnvelope::new(
            ConvoyEvent::DeploymentSubmitted {
                deployment_id: plan.id.clone(),
                service: plan.key.clone(),
                strategy: plan.strategy,
            },
            EventSource::Deployment,
            &self.context,
        )
        .with_correlation(plan.id.to_string());
        if let Some(actor) = &request.requested_by {
            submitted = submitted.with_actor(actor.clone());
        }
        let _ = self.event_tx.send(submitted);
        self.emit_event(ConvoyEvent::DeploymentPlanned {
            deployment_id: plan.id.clone(),
            steps: plan.step_names().iter().map(|s| s.to_string()).collect(),
        });

        info!(steps = plan.steps.len(), "Deployment planned");

        // 4. Execute in the background, holding the lock until terminal
        let cancel = CancellationToken::new();
        self.running.insert(plan.id.clone(), cancel.clone());

        let executor = self.executor.clone();
        let store = self.store.clone();
        let running = self.running.clone();
        let platform = self.platform.clone();
        let event_tx = self.event_tx.clone();
        let context = self.context.clone();
        let scaling_policy = target.scaling_policy.clone();
        let spawned = plan.clone();

        let join = tokio::spawn(async move {
            let _lock = lock;
            let result = executor.execute(&spawned, cancel).await;

            if result.is_success() && result.service.exists {
                if let Some(revision) = &result.service.current_revision {
                    if let Err(e) = store.record_revision(&result.service.key, revision).await {
                        warn!(error = %e, "Failed to record revision history");
                    }
                }
                if let Some(policy) = scaling_policy {
                    match platform.put_scaling_policy(&result.service.key, &policy).await {
                        Ok(()) => {
                            let envelope = ConvoyEventEnvelope::new(
                                ConvoyEvent::ScalingPolicyRegistered {
                                    service: result.service.key.clone(),
                                },
                                EventSource::Deployment,
                                &context,
                            );
                            let _ = event_tx.send(envelope);
                        }
                        Err(e) => warn!(error = %e, "Failed to attach scaling policy"),
                    }
                }
            }

            running.remove(&spawned.id);
            result
        });

        Ok(DeploymentHandle {
            id: plan.id.clone(),
            plan,
            join,
        })
    }

    /// Submit and wait for the terminal result
    pub async fn deploy(&self, request: DeploymentRequest) -> Result<DeploymentResult> {
        self.submit(request).await?.wait().await
    }

    /// Approve a deployment suspended on its approval gate
    #[instrument(skip(self), fields(deployment_id = %id))]
    pub fn approve(&self, id: &DeploymentId, approver: &str) -> Result<()> {
        self.approvals.decide(
            id,
            ApprovalDecision::Approved {
                approver: approver.to_string(),
            },
        )
    }

    /// Reject a deployment suspended on its approval gate
    #[instrument(skip(self), fields(deployment_id = %id))]
    pub fn reject(&self, id: &DeploymentId, approver: &str, reason: &str) -> Result<()> {
        self.approvals.decide(
            id,
            ApprovalDecision::Rejected {
                approver: approver.to_string(),
                reason: reason.to_string(),
            },
        )
    }

    /// Request cancellation; honoured at the next step boundary
    #[instrument(skip(self), fields(deployment_id = %id))]
    pub fn cancel(&self, id: &DeploymentId) -> Result<()> {
        let token = self
            .running
            .get(id)
            .ok_or_else(|| DeploymentError::DeploymentNotFound(id.clone()))?;
        token.cancel();
        info!("Cancellation requested");
        Ok(())
    }

    /// Cancel every deployment still executing; returns how many were signalled
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.running.iter() {
            entry.value().cancel();
            cancelled += 1;
        }
        if cancelled > 0 {
            info!(cancelled, "Cancellation requested for all running deployments");
        }
        cancelled
    }

    pub async fn status(&self, id: &DeploymentId) -> Result<DeploymentState> {
        self.store
            .get_state(id)
            .await?
            .ok_or_else(|| DeploymentError::DeploymentNotFound(id.clone()))
    }

    pub async fn plan(&self, id: &DeploymentId) -> Result<DeploymentPlan> {
        self.store
            .get_plan(id)
            .await?
            .ok_or_else(|| DeploymentError::DeploymentNotFound(id.clone()))
    }

    /// Result of a finished deployment; `None` while it is still running
    pub async fn result(&self, id: &DeploymentId) -> Result<Option<DeploymentResult>> {
        Ok(self.store.get_result(id).await?)
    }

    /// Deployments not yet in a terminal state
    pub async fn active(&self) -> Result<Vec<DeploymentId>> {
        Ok(self.store.list_active().await?)
    }

    pub async fn revision_history(&self, key: &ServiceKey) -> Result<Vec<TaskDefinitionRevision>> {
        Ok(self.store.revision_history(key).await?)
    }

    /// Whether `key` has a plan in flight
    pub fn is_deploying(&self, key: &ServiceKey) -> bool {
        self.locks.is_locked(key)
    }

    /// Subscribe to deployment events
    pub fn subscribe(&self) -> broadcast::Receiver<ConvoyEventEnvelope> {
        self.event_tx.subscribe()
    }

    /// Sender side of the event stream, shared with other components
    pub fn event_sender(&self) -> broadcast::Sender<ConvoyEventEnvelope> {
        self.event_tx.clone()
    }

    pub fn context(&self) -> &ControlPlaneContext {
        &self.context
    }

    fn emit_event(&self, event: ConvoyEvent) {
        let envelope = ConvoyEventEnvelope::new(event, EventSource::Deployment, &self.context);
        let _ = self.event_tx.send(envelope);
    }
}
