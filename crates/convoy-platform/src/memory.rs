//! In-memory simulated platform
//!
//! Keeps task definitions, services, listeners, one-off tasks and metrics in
//! memory. Rollouts converge after a configurable number of DescribeService
//! polls, and tests can script circuit-breaker trips, stalled rollouts, task
//! exit codes and injected faults.

use crate::client::{
    CreateServiceInput, PlatformClient, RunTaskInput, TaskLifecycle, TaskStatus,
    UpdateServiceInput,
};
use crate::error::{PlatformError, Result};
use async_trait::async_trait;
use convoy_types::{
    ClusterId, DeploymentConfiguration, MetricKind, MetricSample, RolloutState, ScalingPolicy,
    ServiceKey, ServiceRecord, TaskDefinitionRevision, TaskId, TaskSpec,
};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

/// How the next rollout of a service ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutOutcome {
    /// Reaches steady state
    Converge,
    /// Tasks fail to start; with the circuit breaker enabled the platform
    /// reverts to the previous revision on its own
    TripCircuitBreaker,
    /// Never reaches steady state
    Stall,
}

#[derive(Debug, Clone)]
struct StoredRevision {
    spec: TaskSpec,
    fingerprint: String,
    active: bool,
}

#[derive(Debug, Clone)]
enum Rollout {
    Settled,
    Converging {
        polls_left: u32,
        outcome: RolloutOutcome,
        revert_to: Option<TaskDefinitionRevision>,
        restore_previous: Option<TaskDefinitionRevision>,
    },
}

#[derive(Debug, Clone)]
struct SimService {
    record: ServiceRecord,
    deployment_configuration: DeploymentConfiguration,
    target_group: Option<String>,
    rollout: Rollout,
}

#[derive(Debug, Clone)]
struct SimTask {
    cluster: ClusterId,
    polls: u32,
    exit_code: i32,
}

/// Simulated container platform
pub struct InMemoryPlatform {
    task_definitions: DashMap<String, BTreeMap<u32, StoredRevision>>,
    services: DashMap<ServiceKey, SimService>,
    listeners: DashMap<String, String>,
    metrics: DashMap<(ServiceKey, MetricKind), f64>,
    scaling_policies: DashMap<ServiceKey, ScalingPolicy>,
    tasks: DashMap<TaskId, SimTask>,
    scripted_rollouts: DashMap<ServiceKey, RolloutOutcome>,
    scripted_exit_codes: DashMap<String, VecDeque<i32>>,
    faults: Mutex<HashMap<&'static str, VecDeque<PlatformError>>>,
    calls: Mutex<Vec<String>>,
    convergence_polls: u32,
}

impl InMemoryPlatform {
    /// Create a platform whose rollouts converge on the first poll
    pub fn new() -> Self {
        Self {
            task_definitions: DashMap::new(),
            services: DashMap::new(),
            listeners: DashMap::new(),
            metrics: DashMap::new(),
            scaling_policies: DashMap::new(),
            tasks: DashMap::new(),
            scripted_rollouts: DashMap::new(),
            scripted_exit_codes: DashMap::new(),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            convergence_polls: 1,
        }
    }

    /// Number of DescribeService polls a rollout needs before it settles
    pub fn with_convergence_polls(mut self, polls: u32) -> Self {
        self.convergence_polls = polls;
        self
    }

    // ═══════════════════════════════════════════════════════════════════
    // SEEDING AND SCRIPTING
    // ═══════════════════════════════════════════════════════════════════

    /// Store a spec under an explicit revision number
    pub fn seed_revision(&self, spec: TaskSpec, revision: u32) -> Result<TaskDefinitionRevision> {
        let fingerprint = fingerprint(&spec)?;
        let family = spec.family.clone();
        self.task_definitions.entry(family.clone()).or_default().insert(
            revision,
            StoredRevision {
                spec,
                fingerprint,
                active: true,
            },
        );
        Ok(TaskDefinitionRevision::new(family, revision))
    }

    /// Insert a steady-state service running `revision`
    pub fn seed_service(
        &self,
        key: ServiceKey,
        revision: TaskDefinitionRevision,
        previous: Option<TaskDefinitionRevision>,
        desired_count: u32,
    ) -> Result<ServiceRecord> {
        let spec = self.spec_of(&revision)?;
        let record = ServiceRecord {
            current_revision: Some(revision),
            previous_revision: previous,
            task_spec: Some(spec),
            desired_count,
            running_count: desired_count,
            pending_count: 0,
            deployment_count: 1,
            rollout_state: RolloutState::Completed,
            exists: true,
            ..ServiceRecord::absent(key.clone())
        };
        self.services.insert(
            key,
            SimService {
                record: record.clone(),
                deployment_configuration: DeploymentConfiguration::default(),
                target_group: None,
                rollout: Rollout::Settled,
            },
        );
        Ok(record)
    }

    /// Create a listener forwarding to `target_group`
    pub fn seed_listener(&self, listener: impl Into<String>, target_group: impl Into<String>) {
        self.listeners.insert(listener.into(), target_group.into());
    }

    /// Decide how the next rollout of `key` ends
    pub fn script_rollout(&self, key: ServiceKey, outcome: RolloutOutcome) {
        self.scripted_rollouts.insert(key, outcome);
    }

    /// Exit codes for successive RunTask calls started by `started_by`
    pub fn script_exit_codes(&self, started_by: impl Into<String>, codes: Vec<i32>) {
        self.scripted_exit_codes
            .insert(started_by.into(), codes.into_iter().collect());
    }

    pub fn set_metric(&self, key: ServiceKey, metric: MetricKind, value: f64) {
        self.metrics.insert((key, metric), value);
    }

    /// Make the next call of `operation` fail with `error`
    pub fn fail_next(&self, operation: &'static str, error: PlatformError) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.entry(operation).or_default().push_back(error);
    }

    // ═══════════════════════════════════════════════════════════════════
    // INSPECTION
    // ═══════════════════════════════════════════════════════════════════

    /// Every operation invoked so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.as_str() == operation)
            .count()
    }

    /// Mutating calls only, i.e. without describes
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("describe_"))
            .collect()
    }

    pub fn revision_count(&self, family: &str) -> usize {
        self.task_definitions
            .get(family)
            .map(|revs| revs.len())
            .unwrap_or(0)
    }

    pub fn is_revision_active(&self, revision: &TaskDefinitionRevision) -> bool {
        self.task_definitions
            .get(revision.family())
            .and_then(|revs| revs.get(&revision.revision()).map(|r| r.active))
            .unwrap_or(false)
    }

    pub fn scaling_policy(&self, key: &ServiceKey) -> Option<ScalingPolicy> {
        self.scaling_policies.get(key).map(|p| p.clone())
    }

    pub fn listener_target(&self, listener: &str) -> Option<String> {
        self.listeners.get(listener).map(|t| t.clone())
    }

    pub fn service_target_group(&self, key: &ServiceKey) -> Option<String> {
        self.services.get(key).and_then(|s| s.target_group.clone())
    }

    // ═══════════════════════════════════════════════════════════════════
    // INTERNALS
    // ═══════════════════════════════════════════════════════════════════

    fn record_call(&self, operation: &'static str) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(operation.to_string());

        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        match faults.get_mut(operation).and_then(|q| q.pop_front()) {
            Some(error) => {
                debug!(operation, error = %error, "Injected platform fault");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn spec_of(&self, revision: &TaskDefinitionRevision) -> Result<TaskSpec> {
        self.task_definitions
            .get(revision.family())
            .and_then(|revs| revs.get(&revision.revision()).map(|r| r.spec.clone()))
            .ok_or_else(|| PlatformError::not_found("task definition", revision.to_string()))
    }

    fn active_spec_of(&self, revision: &TaskDefinitionRevision) -> Result<TaskSpec> {
        if !self.is_revision_active(revision) {
            return Err(PlatformError::not_found(
                "task definition",
                revision.to_string(),
            ));
        }
        self.spec_of(revision)
    }

    fn start_rollout(
        &self,
        service: &mut SimService,
        revert_to: Option<TaskDefinitionRevision>,
        restore_previous: Option<TaskDefinitionRevision>,
    ) {
        let outcome = self
            .scripted_rollouts
            .remove(&service.record.key)
            .map(|(_, o)| o)
            .unwrap_or(RolloutOutcome::Converge);

        service.record.deployment_count = if service.record.exists { 2 } else { 1 };
        service.record.rollout_state = RolloutState::InProgress;
        service.record.pending_count = service.record.desired_count;
        service.rollout = Rollout::Converging {
            polls_left: self.convergence_polls,
            outcome,
            revert_to,
            restore_previous,
        };
    }

    fn advance(&self, service: &mut SimService) {
        let finished = match &mut service.rollout {
            Rollout::Settled => return,
            Rollout::Converging { polls_left, .. } if *polls_left > 0 => {
                *polls_left -= 1;
                *polls_left == 0
            }
            Rollout::Converging { .. } => true,
        };
        if !finished {
            return;
        }

        let rollout = std::mem::replace(&mut service.rollout, Rollout::Settled);
        let Rollout::Converging {
            outcome,
            revert_to,
            restore_previous,
            ..
        } = rollout
        else {
            return;
        };

        let record = &mut service.record;
        let breaker = service.deployment_configuration.circuit_breaker;
        match outcome {
            RolloutOutcome::Converge => {
                record.running_count = record.desired_count;
                record.pending_count = 0;
                record.deployment_count = 1;
                record.rollout_state = RolloutState::Completed;
            }
            RolloutOutcome::TripCircuitBreaker if breaker.enable && breaker.rollback => {
                if let Some(revert) = revert_to {
                    record.task_spec = self.spec_of(&revert).ok();
                    record.current_revision = Some(revert);
                    record.previous_revision = restore_previous;
                }
                record.running_count = record.desired_count;
                record.pending_count = 0;
                record.deployment_count = 1;
                record.rollout_state = RolloutState::RolledBack;
            }
            RolloutOutcome::TripCircuitBreaker => {
                record.running_count = 0;
                record.rollout_state = RolloutState::Failed;
            }
            RolloutOutcome::Stall => {
                service.rollout = Rollout::Converging {
                    polls_left: 0,
                    outcome: RolloutOutcome::Stall,
                    revert_to,
                    restore_previous,
                };
            }
        }
        record.updated_at = chrono::Utc::now();
    }
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn fingerprint(spec: &TaskSpec) -> Result<String> {
    spec.fingerprint()
        .map_err(|e| PlatformError::permanent("register_task_definition", e.to_string()))
}

#[async_trait]
impl PlatformClient for InMemoryPlatform {
    async fn register_task_definition(&self, spec: &TaskSpec) -> Result<TaskDefinitionRevision> {
        self.record_call("register_task_definition")?;
        spec.validate()
            .map_err(|e| PlatformError::permanent("register_task_definition", e.to_string()))?;
        let fingerprint = fingerprint(spec)?;

        let mut revisions = self.task_definitions.entry(spec.family.clone()).or_default();
        if let Some((number, _)) = revisions
            .iter()
            .find(|(_, r)| r.active && r.fingerprint == fingerprint)
        {
            debug!(family = %spec.family, revision = number, "Identical task definition already registered");
            return Ok(TaskDefinitionRevision::new(spec.family.clone(), *number));
        }

        let next = revisions.keys().next_back().map(|n| n + 1).unwrap_or(1);
        revisions.insert(
            next,
            StoredRevision {
                spec: spec.clone(),
                fingerprint,
                active: true,
            },
        );
        debug!(family = %spec.family, revision = next, "Registered task definition");
        Ok(TaskDefinitionRevision::new(spec.family.clone(), next))
    }

    async fn describe_task_definition(&self, revision: &TaskDefinitionRevision) -> Result<TaskSpec> {
        self.record_call("describe_task_definition")?;
        self.spec_of(revision)
    }

    async fn deregister_task_definition(&self, revision: &TaskDefinitionRevision) -> Result<()> {
        self.record_call("deregister_task_definition")?;
        let mut revisions = self
            .task_definitions
            .get_mut(revision.family())
            .ok_or_else(|| PlatformError::not_found("task definition", revision.to_string()))?;
        let stored = revisions
            .get_mut(&revision.revision())
            .ok_or_else(|| PlatformError::not_found("task definition", revision.to_string()))?;
        stored.active = false;
        Ok(())
    }

    async fn create_service(&self, input: &CreateServiceInput) -> Result<ServiceRecord> {
        self.record_call("create_service")?;
        if self.services.contains_key(&input.key) {
            return Err(PlatformError::permanent(
                "create_service",
                format!("service {} already exists", input.key),
            ));
        }
        let spec = self.active_spec_of(&input.revision)?;

        let mut service = SimService {
            record: ServiceRecord {
                current_revision: Some(input.revision.clone()),
                task_spec: Some(spec),
                desired_count: input.desired_count,
                enable_execute_command: input.enable_execute_command,
                ..ServiceRecord::absent(input.key.clone())
            },
            deployment_configuration: input.deployment_configuration,
            target_group: input.target_group.clone(),
            rollout: Rollout::Settled,
        };
        self.start_rollout(&mut service, None, None);
        service.record.exists = true;

        let record = service.record.clone();
        self.services.insert(input.key.clone(), service);
        Ok(record)
    }

    async fn update_service(
        &self,
        key: &ServiceKey,
        input: &UpdateServiceInput,
    ) -> Result<ServiceRecord> {
        self.record_call("update_service")?;
        let new_spec = match &input.revision {
            Some(revision) => Some(self.active_spec_of(revision)?),
            None => None,
        };

        let mut service = self
            .services
            .get_mut(key)
            .ok_or_else(|| PlatformError::not_found("service", key.to_string()))?;

        if let Some(config) = input.deployment_configuration {
            service.deployment_configuration = config;
        }
        if let Some(enable) = input.enable_execute_command {
            service.record.enable_execute_command = enable;
        }
        if let Some(count) = input.desired_count {
            service.record.desired_count = count;
        }

        let old_current = service.record.current_revision.clone();
        let old_previous = service.record.previous_revision.clone();
        let revision_changed = input.revision.is_some() && input.revision != old_current;

        if let (true, Some(revision), Some(spec)) =
            (revision_changed, input.revision.clone(), new_spec)
        {
            service.record.previous_revision = old_current.clone();
            service.record.current_revision = Some(revision);
            service.record.task_spec = Some(spec);
        }

        if revision_changed || input.force_new_deployment {
            let revert_to = if revision_changed {
                old_current
            } else {
                service.record.current_revision.clone()
            };
            let restore_previous = if revision_changed {
                old_previous
            } else {
                service.record.previous_revision.clone()
            };
            self.start_rollout(&mut service, revert_to, restore_previous);
            service.record.updated_at = chrono::Utc::now();
            return Ok(service.record.clone());
        }

        // A settled service forgets how its last rollout ended
        if matches!(service.rollout, Rollout::Settled) {
            service.record.rollout_state = RolloutState::Completed;
        }
        if input.desired_count.is_some()
            && service.record.running_count != service.record.desired_count
        {
            service.record.pending_count = service
                .record
                .desired_count
                .saturating_sub(service.record.running_count);
            service.rollout = Rollout::Converging {
                polls_left: self.convergence_polls,
                outcome: RolloutOutcome::Converge,
                revert_to: None,
                restore_previous: None,
            };
        }

        service.record.updated_at = chrono::Utc::now();
        Ok(service.record.clone())
    }

    async fn delete_service(&self, key: &ServiceKey) -> Result<()> {
        self.record_call("delete_service")?;
        self.services
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| PlatformError::not_found("service", key.to_string()))
    }

    async fn describe_service(&self, key: &ServiceKey) -> Result<ServiceRecord> {
        self.record_call("describe_service")?;
        match self.services.get_mut(key) {
            Some(mut service) => {
                self.advance(&mut service);
                Ok(service.record.clone())
            }
            None => Ok(ServiceRecord::absent(key.clone())),
        }
    }

    async fn run_task(&self, input: &RunTaskInput) -> Result<Vec<TaskId>> {
        self.record_call("run_task")?;
        self.active_spec_of(&input.revision)?;

        let exit_code = self
            .scripted_exit_codes
            .get_mut(&input.started_by)
            .and_then(|mut codes| codes.pop_front())
            .unwrap_or(0);

        let ids: Vec<TaskId> = (0..input.count).map(|_| TaskId::generate()).collect();
        for id in &ids {
            self.tasks.insert(
                id.clone(),
                SimTask {
                    cluster: input.cluster.clone(),
                    polls: 0,
                    exit_code,
                },
            );
        }
        debug!(started_by = %input.started_by, count = input.count, "Started tasks");
        Ok(ids)
    }

    async fn describe_tasks(&self, cluster: &ClusterId, tasks: &[TaskId]) -> Result<Vec<TaskStatus>> {
        self.record_call("describe_tasks")?;
        let mut statuses = Vec::with_capacity(tasks.len());
        for id in tasks {
            let mut task = self
                .tasks
                .get_mut(id)
                .filter(|t| &t.cluster == cluster)
                .ok_or_else(|| PlatformError::not_found("task", id.to_string()))?;
            task.polls += 1;
            let status = match task.polls {
                1 => TaskStatus {
                    task_id: id.clone(),
                    last_status: TaskLifecycle::Running,
                    exit_code: None,
                    stopped_reason: None,
                },
                _ => TaskStatus {
                    task_id: id.clone(),
                    last_status: TaskLifecycle::Stopped,
                    exit_code: Some(task.exit_code),
                    stopped_reason: (task.exit_code != 0)
                        .then(|| "Essential container in task exited".to_string()),
                },
            };
            statuses.push(status);
        }
        Ok(statuses)
    }

    async fn put_scaling_policy(&self, key: &ServiceKey, policy: &ScalingPolicy) -> Result<()> {
        self.record_call("put_scaling_policy")?;
        policy
            .validate()
            .map_err(|e| PlatformError::permanent("put_scaling_policy", e.to_string()))?;
        if !self.services.contains_key(key) {
            return Err(PlatformError::not_found("service", key.to_string()));
        }
        self.scaling_policies.insert(key.clone(), policy.clone());
        Ok(())
    }

    async fn describe_metric(
        &self,
        key: &ServiceKey,
        metric: MetricKind,
    ) -> Result<Option<MetricSample>> {
        self.record_call("describe_metric")?;
        if !self.services.contains_key(key) {
            return Err(PlatformError::not_found("service", key.to_string()));
        }
        Ok(self
            .metrics
            .get(&(key.clone(), metric))
            .map(|value| MetricSample {
                metric,
                value: *value,
                at: chrono::Utc::now(),
            }))
    }

    async fn switch_traffic(&self, listener: &str, target_group: &str) -> Result<()> {
        self.record_call("switch_traffic")?;
        let mut current = self
            .listeners
            .get_mut(listener)
            .ok_or_else(|| PlatformError::not_found("listener", listener))?;
        *current = target_group.to_string();
        Ok(())
    }

    async fn describe_listener(&self, listener: &str) -> Result<Option<String>> {
        self.record_call("describe_listener")?;
        Ok(self.listeners.get(listener).map(|t| t.clone()))
    }
}
