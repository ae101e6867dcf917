//! Deployment Executor
//!
//! Runs a [`DeploymentPlan`] against the platform: guards first, then steps
//! strictly in order, suspending on approval gates and polling while the
//! platform converges. A failed step triggers the plan's rollback when
//! something has already been changed.

use crate::approval::{wait_for_decision, ApprovalDecision, ApprovalRegistry};
use crate::error::{DeploymentError, Result};
use crate::state::DeploymentStateStore;
use convoy_platform::{
    CreateServiceInput, PlatformClient, RetryPolicy, RunTaskInput, UpdateServiceInput,
};
use convoy_types::{
    ControlPlaneContext, ConvoyEvent, ConvoyEventEnvelope, DeploymentId, DeploymentPlan,
    DeploymentState, EventSource, Guard, PlanStep, RevisionRef, RolloutState, ServiceKey,
    ServiceRecord, Step, StepOutcome, StepStatus, StrategyKind, TaskDefinitionRevision, TaskId,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default interval between DescribeService polls while waiting
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of executing one plan
#[derive(Debug, Clone)]
pub struct DeploymentResult {
    pub deployment_id: DeploymentId,
    pub key: ServiceKey,
    pub strategy: StrategyKind,
    pub state: DeploymentState,
    /// Last known record of the service the plan worked on
    pub service: ServiceRecord,
    /// Forward outcomes in plan order, followed by rollback outcomes
    pub steps: Vec<StepOutcome>,
    pub failed_step: Option<usize>,
    pub error: Option<DeploymentError>,
    pub registered_revision: Option<TaskDefinitionRevision>,
    /// Tasks started by RunTaskOnce steps
    pub task_ids: Vec<TaskId>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

impl DeploymentResult {
    pub fn is_success(&self) -> bool {
        self.state == DeploymentState::Succeeded
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }

    pub fn forward_steps(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| !s.rollback)
    }

    pub fn rollback_steps(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.rollback)
    }
}

/// Forward step that stopped the plan
#[derive(Debug)]
struct StepFailure {
    index: usize,
    error: DeploymentError,
}

/// Mutable state of one execution
struct Run {
    outcomes: Vec<StepOutcome>,
    completed: Vec<bool>,
    registered: Option<TaskDefinitionRevision>,
    last_record: ServiceRecord,
    task_ids: Vec<TaskId>,
}

impl Run {
    fn new(plan: &DeploymentPlan) -> Self {
        Self {
            outcomes: Vec::with_capacity(plan.steps.len()),
            completed: vec![false; plan.steps.len()],
            registered: None,
            last_record: ServiceRecord::absent(plan.key.clone()),
            task_ids: Vec::new(),
        }
    }

    fn mutated(&self, plan: &DeploymentPlan) -> bool {
        plan.steps
            .iter()
            .zip(&self.completed)
            .any(|(planned, done)| *done && planned.step.is_mutating())
    }

    fn resolve(&self, revision: &RevisionRef) -> Result<TaskDefinitionRevision> {
        match revision {
            RevisionRef::Fixed(revision) => Ok(revision.clone()),
            RevisionRef::Registered => self.registered.clone().ok_or_else(|| {
                DeploymentError::Internal("no revision registered earlier in the plan".to_string())
            }),
        }
    }
}

/// Executes deployment plans against a platform
pub struct DeploymentExecutor {
    platform: Arc<dyn PlatformClient>,
    config: ExecutorConfig,
    approvals: Arc<ApprovalRegistry>,
    store: Arc<dyn DeploymentStateStore>,
    event_tx: broadcast::Sender<ConvoyEventEnvelope>,
    context: ControlPlaneContext,
}

impl DeploymentExecutor {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        config: ExecutorConfig,
        approvals: Arc<ApprovalRegistry>,
        store: Arc<dyn DeploymentStateStore>,
        event_tx: broadcast::Sender<ConvoyEventEnvelope>,
        context: ControlPlaneContext,
    ) -> Self {
        Self {
            platform,
            config,
            approvals,
            store,
            event_tx,
            context,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute a plan to a terminal state.
    ///
    /// `cancel` is observed between steps and while suspended on an approval
    /// gate. A step already dispatched to the platform is never retracted.
    #[instrument(skip(self, plan, cancel), fields(deployment_id = %plan.id, service = %plan.key))]
    pub async fn execute(&self, plan: &DeploymentPlan, cancel: CancellationToken) -> DeploymentResult {
        let started_at = chrono::Utc::now();
        let clock = tokio::time::Instant::now();
        let mut run = Run::new(plan);

        self.set_state(&plan.id, DeploymentState::Running).await;
        info!(strategy = %plan.strategy, steps = plan.steps.len(), "Executing deployment plan");

        let (state, failure) = match self.run_forward(plan, &cancel, &mut run).await {
            Ok(()) => (DeploymentState::Succeeded, None),
            Err(failure) => {
                let state = self.handle_failure(plan, &mut run, &failure).await;
                (state, Some(failure))
            }
        };

        self.refresh_record(&mut run).await;

        let result = DeploymentResult {
            deployment_id: plan.id.clone(),
            key: plan.key.clone(),
            strategy: plan.strategy,
            state,
            service: run.last_record,
            steps: run.outcomes,
            failed_step: failure.as_ref().map(|f| f.index),
            error: failure.map(|f| f.error),
            registered_revision: run.registered,
            task_ids: run.task_ids,
            started_at,
            finished_at: chrono::Utc::now(),
        };

        if let Err(e) = self.store.save_result(&result).await {
            error!(error = %e, "Failed to persist deployment result");
        }
        self.emit_terminal(&result, clock.elapsed());
        result
    }

    async fn run_forward(
        &self,
        plan: &DeploymentPlan,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> std::result::Result<(), StepFailure> {
        let mut attempts = 0;
        run.last_record = self
            .describe(&plan.key, &mut attempts)
            .await
            .map_err(|error| StepFailure { index: 0, error })?;

        for (index, guard) in plan.guards() {
            if let Err(error) = self.check_guard(&plan.key, guard).await {
                warn!(index, guard = %guard, error = %error, "Plan guard violated");
                return Err(StepFailure { index, error });
            }
        }

        for (index, planned) in plan.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(index, "Cancellation observed at step boundary");
                return Err(StepFailure {
                    index,
                    error: DeploymentError::Cancelled,
                });
            }

            let name = planned.step.name();
            let started_at = chrono::Utc::now();
            self.emit_event(ConvoyEvent::StepStarted {
                deployment_id: plan.id.clone(),
                index,
                step: name.to_string(),
            });
            debug!(index, step = name, "Step started");

            let mut attempts = 0;
            let result = match &planned.step {
                Step::ManualApprovalGate { timeout } => {
                    attempts = 1;
                    self.await_approval(&plan.id, *timeout, cancel).await
                }
                step => match self.recheck_guard(plan, index, planned).await {
                    Ok(()) => self.run_timed(planned, step, run, &mut attempts).await,
                    Err(error) => Err(error),
                },
            };

            let status = if result.is_ok() {
                StepStatus::Succeeded
            } else {
                StepStatus::Failed
            };
            let detail = match &result {
                Ok(detail) => detail.clone(),
                Err(e) => Some(e.to_string()),
            };
            run.outcomes.push(StepOutcome {
                index,
                step: name.to_string(),
                status,
                rollback: false,
                attempts,
                detail,
                started_at,
                finished_at: chrono::Utc::now(),
            });

            match result {
                Ok(_) => {
                    run.completed[index] = true;
                    self.emit_event(ConvoyEvent::StepCompleted {
                        deployment_id: plan.id.clone(),
                        index,
                        step: name.to_string(),
                    });
                }
                Err(error) => {
                    warn!(index, step = name, error = %error, "Step failed");
                    self.emit_event(ConvoyEvent::StepFailed {
                        deployment_id: plan.id.clone(),
                        index,
                        step: name.to_string(),
                        reason: error.to_string(),
                    });
                    return Err(StepFailure { index, error });
                }
            }
        }

        Ok(())
    }

    /// Guards must still hold when their step is dispatched, not only when
    /// the plan started
    async fn recheck_guard(
        &self,
        plan: &DeploymentPlan,
        index: usize,
        planned: &PlanStep,
    ) -> Result<()> {
        let Some(guard) = &planned.guard else {
            return Ok(());
        };
        self.check_guard(&plan.key, guard).await.map_err(|error| {
            warn!(index, guard = %guard, error = %error, "Guard no longer holds");
            error
        })
    }

    async fn run_timed(
        &self,
        planned: &PlanStep,
        step: &Step,
        run: &mut Run,
        attempts: &mut u32,
    ) -> Result<Option<String>> {
        match tokio::time::timeout(planned.timeout, self.run_step(step, run, attempts)).await {
            Ok(result) => result,
            Err(_) => Err(DeploymentError::Timeout {
                operation: step.name().to_string(),
                after: planned.timeout,
            }),
        }
    }

    /// Dispatch one platform step; returns a short detail for the outcome
    async fn run_step(&self, step: &Step, run: &mut Run, attempts: &mut u32) -> Result<Option<String>> {
        let platform = self.platform.as_ref();

        match step {
            Step::RegisterTaskDefinition { spec } => {
                let revision = self
                    .call("register_task_definition", attempts, move || {
                        platform.register_task_definition(spec)
                    })
                    .await?;
                info!(revision = %revision, "Task definition registered");
                let detail = revision.to_string();
                run.registered = Some(revision);
                Ok(Some(detail))
            }

            Step::CreateService { service } => {
                let input = CreateServiceInput {
                    key: service.key.clone(),
                    revision: run.resolve(&service.revision)?,
                    desired_count: service.desired_count,
                    deployment_configuration: service.deployment_configuration,
                    enable_execute_command: service.enable_execute_command,
                    target_group: service.target_group.clone(),
                };
                let input = &input;
                let record = self
                    .call("create_service", attempts, move || platform.create_service(input))
                    .await?;
                let detail = format!("{} on {}", record.key, input.revision);
                run.last_record = record;
                Ok(Some(detail))
            }

            Step::UpdateService { key, update } => {
                let revision = match &update.revision {
                    Some(revision) => Some(run.resolve(revision)?),
                    None => None,
                };
                let input = UpdateServiceInput {
                    revision,
                    desired_count: update.desired_count,
                    deployment_configuration: update.deployment_configuration,
                    force_new_deployment: update.force_new_deployment,
                    enable_execute_command: update.enable_execute_command,
                };
                let input = &input;
                let record = self
                    .call("update_service", attempts, move || platform.update_service(key, input))
                    .await?;
                let detail = record
                    .current_revision
                    .as_ref()
                    .map(|r| format!("{} on {}", key, r));
                run.last_record = record;
                Ok(detail)
            }

            Step::WaitForStable { key } => self.wait_for_stable(key, run, attempts).await,

            Step::SwitchTraffic {
                listener,
                from_target_group,
                to_target_group,
            } => {
                self.call("switch_traffic", attempts, move || {
                    platform.switch_traffic(listener, to_target_group)
                })
                .await?;
                info!(listener = %listener, from = %from_target_group, to = %to_target_group, "Traffic switched");
                Ok(Some(format!("{} -> {}", from_target_group, to_target_group)))
            }

            Step::DeregisterOld { key, revision } => {
                tolerate_missing(
                    self.call("delete_service", attempts, move || platform.delete_service(key))
                        .await,
                )?;
                if let Some(revision) = revision {
                    tolerate_missing(
                        self.call("deregister_task_definition", attempts, move || {
                            platform.deregister_task_definition(revision)
                        })
                        .await,
                    )?;
                }
                Ok(Some(format!("removed {}", key)))
            }

            Step::RunTaskOnce {
                cluster,
                job_name,
                revision,
                count,
                attempts: runs,
            } => {
                let input = RunTaskInput {
                    cluster: cluster.clone(),
                    revision: run.resolve(revision)?,
                    count: *count,
                    started_by: job_name.clone(),
                };
                self.run_task_once(&input, *runs, run, attempts).await
            }

            Step::ManualApprovalGate { .. } => Err(DeploymentError::Internal(
                "approval gate dispatched as a platform step".to_string(),
            )),
        }
    }

    async fn wait_for_stable(
        &self,
        key: &ServiceKey,
        run: &mut Run,
        attempts: &mut u32,
    ) -> Result<Option<String>> {
        loop {
            let record = self.describe(key, attempts).await?;
            let rollout_state = record.rollout_state;
            let stable = record.is_stable();
            let exists = record.exists;
            run.last_record = record;

            if !exists {
                return Err(DeploymentError::NotFound(format!("service {}", key)));
            }
            match rollout_state {
                RolloutState::RolledBack => {
                    return Err(DeploymentError::CircuitBreakerTripped {
                        service: key.clone(),
                    })
                }
                RolloutState::Failed => {
                    return Err(DeploymentError::PlatformPermanent {
                        operation: "wait_for_stable".to_string(),
                        message: format!("rollout of {} failed", key),
                    })
                }
                _ if stable => {
                    return Ok(Some(format!(
                        "{} running {}",
                        key, run.last_record.running_count
                    )))
                }
                _ => {
                    debug!(
                        service = %key,
                        running = run.last_record.running_count,
                        desired = run.last_record.desired_count,
                        "Service not yet stable"
                    );
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn run_task_once(
        &self,
        input: &RunTaskInput,
        runs: u32,
        run: &mut Run,
        attempts: &mut u32,
    ) -> Result<Option<String>> {
        let platform = self.platform.as_ref();
        let runs = runs.max(1);
        let mut reason = String::new();

        for attempt in 1..=runs {
            let tasks = self
                .call("run_task", attempts, move || platform.run_task(input))
                .await?;
            run.task_ids.extend(tasks.iter().cloned());
            info!(job = %input.started_by, attempt, tasks = tasks.len(), "Batch tasks started");

            let tasks = &tasks;
            let statuses = loop {
                let statuses = self
                    .call("describe_tasks", attempts, move || {
                        platform.describe_tasks(&input.cluster, tasks)
                    })
                    .await?;
                if statuses.iter().all(|s| s.is_stopped()) {
                    break statuses;
                }
                tokio::time::sleep(self.config.poll_interval).await;
            };

            match statuses.iter().find(|s| !s.succeeded()) {
                None => {
                    return Ok(Some(format!(
                        "{} task(s) of {} exited 0",
                        statuses.len(),
                        input.started_by
                    )))
                }
                Some(failed) => {
                    reason = match (&failed.stopped_reason, failed.exit_code) {
                        (Some(why), _) => why.clone(),
                        (None, Some(code)) => format!("task {} exited with {}", failed.task_id, code),
                        (None, None) => format!("task {} stopped without exit code", failed.task_id),
                    };
                    warn!(job = %input.started_by, attempt, runs, reason = %reason, "Batch run failed");
                }
            }
        }

        Err(DeploymentError::TaskRunFailed {
            job: input.started_by.clone(),
            reason,
        })
    }

    async fn await_approval(
        &self,
        id: &DeploymentId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let mut rx = self.approvals.open(id);
        self.set_state(id, DeploymentState::AwaitingApproval).await;
        self.emit_event(ConvoyEvent::ApprovalRequired {
            deployment_id: id.clone(),
            timeout_seconds: timeout.as_secs(),
        });
        info!(timeout_secs = timeout.as_secs(), "Waiting for approval");

        let waited = tokio::select! {
            decision = wait_for_decision(&mut rx) => Ok(decision),
            _ = tokio::time::sleep(timeout) => Err(DeploymentError::ApprovalExpired(timeout)),
            _ = cancel.cancelled() => Err(DeploymentError::Cancelled),
        };
        self.approvals.close(id);
        self.set_state(id, DeploymentState::Running).await;

        match waited? {
            Some(ApprovalDecision::Approved { approver }) => {
                info!(approver = %approver, "Deployment approved");
                self.emit_event(ConvoyEvent::ApprovalGranted {
                    deployment_id: id.clone(),
                    approver: approver.clone(),
                });
                Ok(Some(format!("approved by {}", approver)))
            }
            Some(ApprovalDecision::Rejected { approver, reason }) => {
                info!(approver = %approver, reason = %reason, "Deployment rejected");
                self.emit_event(ConvoyEvent::ApprovalRejected {
                    deployment_id: id.clone(),
                    approver: approver.clone(),
                    reason: reason.clone(),
                });
                Err(DeploymentError::ApprovalRejected { approver, reason })
            }
            None => Err(DeploymentError::Cancelled),
        }
    }

    /// Decide the terminal state after a forward step failed
    async fn handle_failure(
        &self,
        plan: &DeploymentPlan,
        run: &mut Run,
        failure: &StepFailure,
    ) -> DeploymentState {
        match &failure.error {
            DeploymentError::Cancelled => return DeploymentState::Failed,
            DeploymentError::CircuitBreakerTripped { service } => {
                warn!(service = %service, "Platform circuit breaker rolled the service back");
                self.emit_event(ConvoyEvent::CircuitBreakerTripped {
                    deployment_id: plan.id.clone(),
                    service: service.clone(),
                });
                return DeploymentState::RolledBack;
            }
            DeploymentError::ApprovalExpired(_) if !run.mutated(plan) => {
                return DeploymentState::Expired
            }
            _ => {}
        }

        let rollback = match &plan.rollback {
            Some(rollback) if run.mutated(plan) => rollback,
            _ => return DeploymentState::Failed,
        };

        info!(
            failed_step = failure.index,
            steps = rollback.steps.len(),
            "Running rollback plan"
        );

        for (index, planned) in rollback.steps.iter().enumerate() {
            let name = planned.step.name();
            let started_at = chrono::Utc::now();

            let needed = planned
                .requires_completed
                .map_or(true, |i| run.completed.get(i).copied().unwrap_or(false));
            if !needed {
                run.outcomes.push(StepOutcome {
                    index,
                    step: name.to_string(),
                    status: StepStatus::Skipped,
                    rollback: true,
                    attempts: 0,
                    detail: None,
                    started_at,
                    finished_at: started_at,
                });
                continue;
            }

            let mut attempts = 0;
            let result = self.run_timed(planned, &planned.step, run, &mut attempts).await;
            let (status, detail) = match &result {
                Ok(detail) => (StepStatus::Succeeded, detail.clone()),
                Err(e) => (StepStatus::Failed, Some(e.to_string())),
            };
            run.outcomes.push(StepOutcome {
                index,
                step: name.to_string(),
                status,
                rollback: true,
                attempts,
                detail,
                started_at,
                finished_at: chrono::Utc::now(),
            });

            if let Err(e) = result {
                error!(index, step = name, error = %e, "Rollback step failed");
                return DeploymentState::Failed;
            }
        }

        DeploymentState::RolledBack
    }

    async fn check_guard(&self, plan_key: &ServiceKey, guard: &Guard) -> Result<()> {
        let mut attempts = 0;
        match guard {
            Guard::NoDeploymentInFlight(key) => {
                let record = self.describe(key, &mut attempts).await?;
                if record.exists && record.has_deployment_in_flight() {
                    return Err(DeploymentError::conflict(
                        key,
                        "the platform reports a rollout in progress",
                    ));
                }
            }
            Guard::ServiceAbsent(key) => {
                if self.describe(key, &mut attempts).await?.exists {
                    return Err(DeploymentError::conflict(key, "service already exists"));
                }
            }
            Guard::ServiceExists(key) => {
                if !self.describe(key, &mut attempts).await?.exists {
                    return Err(DeploymentError::conflict(key, "service no longer exists"));
                }
            }
            Guard::TrafficOn {
                listener,
                target_group,
            } => {
                let platform = self.platform.as_ref();
                let current = self
                    .call("describe_listener", &mut attempts, move || {
                        platform.describe_listener(listener)
                    })
                    .await?;
                if current.as_deref() != Some(target_group.as_str()) {
                    return Err(DeploymentError::ConflictingDeployment {
                        service: plan_key.clone(),
                        reason: format!(
                            "listener {} forwards to {}, expected {}",
                            listener,
                            current.as_deref().unwrap_or("nothing"),
                            target_group
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    async fn describe(&self, key: &ServiceKey, attempts: &mut u32) -> Result<ServiceRecord> {
        let platform = self.platform.as_ref();
        self.call("describe_service", attempts, move || platform.describe_service(key))
            .await
    }

    /// Take a final snapshot of the service for the result
    async fn refresh_record(&self, run: &mut Run) {
        let key = run.last_record.key.clone();
        let mut attempts = 0;
        match self.describe(&key, &mut attempts).await {
            Ok(record) => run.last_record = record,
            Err(e) => warn!(service = %key, error = %e, "Could not refresh service record"),
        }
    }

    /// Platform call with the configured retry policy
    async fn call<T, F, Fut>(&self, operation: &str, attempts: &mut u32, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = convoy_platform::Result<T>>,
    {
        let (result, made) = self.config.retry.run(operation, call).await;
        *attempts += made;
        result.map_err(DeploymentError::from)
    }

    async fn set_state(&self, id: &DeploymentId, state: DeploymentState) {
        if let Err(e) = self.store.update_state(id, state).await {
            warn!(deployment_id = %id, state = %state, error = %e, "Failed to record state");
        }
    }

    fn emit_terminal(&self, result: &DeploymentResult, elapsed: Duration) {
        let id = result.deployment_id.clone();
        let event = match result.state {
            DeploymentState::Succeeded => {
                info!(duration_secs = elapsed.as_secs(), "Deployment succeeded");
                ConvoyEvent::DeploymentSucceeded {
                    deployment_id: id,
                    revision: result
                        .registered_revision
                        .clone()
                        .or_else(|| result.service.current_revision.clone()),
                    duration_seconds: elapsed.as_secs(),
                }
            }
            DeploymentState::RolledBack => {
                warn!(reason = ?result.failure_reason(), "Deployment rolled back");
                ConvoyEvent::DeploymentRolledBack {
                    deployment_id: id,
                    to_revision: result.service.current_revision.clone(),
                }
            }
            DeploymentState::Expired => {
                warn!("Approval window elapsed, deployment expired");
                ConvoyEvent::DeploymentExpired { deployment_id: id }
            }
            _ => {
                error!(
                    failed_step = ?result.failed_step,
                    reason = ?result.failure_reason(),
                    "Deployment failed"
                );
                ConvoyEvent::DeploymentFailed {
                    deployment_id: id,
                    failed_step: result.failed_step,
                    reason: result.failure_reason().unwrap_or_default(),
                }
            }
        };
        self.emit_event(event);
    }

    fn emit_event(&self, event: ConvoyEvent) {
        let envelope = ConvoyEventEnvelope::new(event, EventSource::Executor, &self.context);
        let _ = self.event_tx.send(envelope);
    }
}

/// Removing something that is already gone counts as done
fn tolerate_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(DeploymentError::NotFound(what)) => {
            debug!(what = %what, "Already removed");
            Ok(())
        }
        other => other,
    }
}
