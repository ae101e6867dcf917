//! Deployment state persistence

use crate::executor::DeploymentResult;
use async_trait::async_trait;
use convoy_types::{DeploymentId, DeploymentPlan, DeploymentState, ServiceKey, TaskDefinitionRevision};
use dashmap::DashMap;

/// State store for plans, execution state, results and revision history
#[async_trait]
pub trait DeploymentStateStore: Send + Sync {
    /// Save a freshly built plan; its state starts as Pending
    async fn save_plan(&self, plan: &DeploymentPlan) -> Result<(), StateStoreError>;

    /// Get a plan by deployment ID
    async fn get_plan(&self, id: &DeploymentId) -> Result<Option<DeploymentPlan>, StateStoreError>;

    /// Update execution state
    async fn update_state(
        &self,
        id: &DeploymentId,
        state: DeploymentState,
    ) -> Result<(), StateStoreError>;

    /// Get execution state
    async fn get_state(&self, id: &DeploymentId) -> Result<Option<DeploymentState>, StateStoreError>;

    /// Save the final result; also updates the state
    async fn save_result(&self, result: &DeploymentResult) -> Result<(), StateStoreError>;

    /// Get the final result of a finished deployment
    async fn get_result(
        &self,
        id: &DeploymentId,
    ) -> Result<Option<DeploymentResult>, StateStoreError>;

    /// Deployments that have not reached a terminal state
    async fn list_active(&self) -> Result<Vec<DeploymentId>, StateStoreError>;

    /// Append a revision to the service's history (consecutive duplicates are ignored)
    async fn record_revision(
        &self,
        key: &ServiceKey,
        revision: &TaskDefinitionRevision,
    ) -> Result<(), StateStoreError>;

    /// Revisions the service has run, oldest first
    async fn revision_history(
        &self,
        key: &ServiceKey,
    ) -> Result<Vec<TaskDefinitionRevision>, StateStoreError>;

    /// Revision before the most recent one
    async fn previous_revision(
        &self,
        key: &ServiceKey,
    ) -> Result<Option<TaskDefinitionRevision>, StateStoreError>;
}

/// State store errors
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// In-memory implementation for development
pub struct InMemoryDeploymentStateStore {
    plans: DashMap<DeploymentId, DeploymentPlan>,
    states: DashMap<DeploymentId, DeploymentState>,
    results: DashMap<DeploymentId, DeploymentResult>,
    history: DashMap<ServiceKey, Vec<TaskDefinitionRevision>>,
}

impl InMemoryDeploymentStateStore {
    /// Create a new in-memory state store
    pub fn new() -> Self {
        Self {
            plans: DashMap::new(),
            states: DashMap::new(),
            results: DashMap::new(),
            history: DashMap::new(),
        }
    }
}

impl Default for InMemoryDeploymentStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeploymentStateStore for InMemoryDeploymentStateStore {
    async fn save_plan(&self, plan: &DeploymentPlan) -> Result<(), StateStoreError> {
        self.plans.insert(plan.id.clone(), plan.clone());
        self.states.insert(plan.id.clone(), DeploymentState::Pending);
        Ok(())
    }

    async fn get_plan(&self, id: &DeploymentId) -> Result<Option<DeploymentPlan>, StateStoreError> {
        Ok(self.plans.get(id).map(|p| p.clone()))
    }

    async fn update_state(
        &self,
        id: &DeploymentId,
        state: DeploymentState,
    ) -> Result<(), StateStoreError> {
        match self.states.get_mut(id) {
            Some(mut current) => {
                *current = state;
                Ok(())
            }
            None => Err(StateStoreError::NotFound(id.to_string())),
        }
    }

    async fn get_state(&self, id: &DeploymentId) -> Result<Option<DeploymentState>, StateStoreError> {
        Ok(self.states.get(id).map(|s| *s))
    }

    async fn save_result(&self, result: &DeploymentResult) -> Result<(), StateStoreError> {
        self.states.insert(result.deployment_id.clone(), result.state);
        self.results
            .insert(result.deployment_id.clone(), result.clone());
        Ok(())
    }

    async fn get_result(
        &self,
        id: &DeploymentId,
    ) -> Result<Option<DeploymentResult>, StateStoreError> {
        Ok(self.results.get(id).map(|r| r.clone()))
    }

    async fn list_active(&self) -> Result<Vec<DeploymentId>, StateStoreError> {
        Ok(self
            .states
            .iter()
            .filter(|s| !s.value().is_terminal())
            .map(|s| s.key().clone())
            .collect())
    }

    async fn record_revision(
        &self,
        key: &ServiceKey,
        revision: &TaskDefinitionRevision,
    ) -> Result<(), StateStoreError> {
        let mut history = self.history.entry(key.clone()).or_default();
        if history.last() != Some(revision) {
            history.push(revision.clone());
        }
        Ok(())
    }

    async fn revision_history(
        &self,
        key: &ServiceKey,
    ) -> Result<Vec<TaskDefinitionRevision>, StateStoreError> {
        Ok(self.history.get(key).map(|h| h.clone()).unwrap_or_default())
    }

    async fn previous_revision(
        &self,
        key: &ServiceKey,
    ) -> Result<Option<TaskDefinitionRevision>, StateStoreError> {
        if let Some(history) = self.history.get(key) {
            if history.len() >= 2 {
                return Ok(Some(history[history.len() - 2].clone()));
            }
        }
        Ok(None)
    }
}
