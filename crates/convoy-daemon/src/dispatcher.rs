//! Schedule entries turned into deployment submissions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_deployment::DeploymentManager;
use convoy_scheduler::{ScheduleDispatcher, ScheduleError};
use convoy_types::{
    BatchRun, DeploymentParams, DeploymentRequest, ScheduleEntry, ScheduleTarget, ServiceKey,
    Strategy,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Submits the target of a due entry to the deployment manager.
///
/// Submission returns as soon as the plan is accepted; the outcome is
/// reported on the event stream and logged when the run finishes.
pub struct ManagerDispatcher {
    manager: Arc<DeploymentManager>,
    batch_params: DeploymentParams,
}

impl ManagerDispatcher {
    pub fn new(manager: Arc<DeploymentManager>, batch_params: DeploymentParams) -> Self {
        Self {
            manager,
            batch_params,
        }
    }

    /// The request an entry submits when it fires
    pub fn request_for(&self, entry: &ScheduleEntry) -> DeploymentRequest {
        let request = match &entry.target {
            ScheduleTarget::Deployment { request } => request.reissue(),
            ScheduleTarget::RunTask(batch) => self.batch_request(batch),
        };
        request.requested_by(entry.id.to_string())
    }

    fn batch_request(&self, batch: &BatchRun) -> DeploymentRequest {
        let key = ServiceKey::new(batch.cluster.to_string(), batch.job_name.clone());
        let mut request = DeploymentRequest::new(
            key,
            Strategy::ScheduledBatch {
                count: batch.count,
                attempts: batch.attempts,
            },
        )
        .with_task(batch.task.clone());
        request.params = self.batch_params.clone();
        request
    }
}

#[async_trait]
impl ScheduleDispatcher for ManagerDispatcher {
    async fn dispatch(&self, entry: &ScheduleEntry, minute: DateTime<Utc>) -> convoy_scheduler::Result<()> {
        let request = self.request_for(entry);
        let handle = self
            .manager
            .submit(request)
            .await
            .map_err(|e| ScheduleError::Dispatch(e.to_string()))?;

        info!(
            entry_id = %entry.id,
            deployment_id = %handle.id,
            %minute,
            "Scheduled deployment submitted"
        );

        let entry_id = entry.id.clone();
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(result) if result.is_success() => {
                    info!(entry_id = %entry_id, deployment_id = %result.deployment_id, "Scheduled run finished");
                }
                Ok(result) => {
                    warn!(
                        entry_id = %entry_id,
                        deployment_id = %result.deployment_id,
                        state = %result.state,
                        reason = %result.failure_reason().unwrap_or_default(),
                        "Scheduled run did not succeed"
                    );
                }
                Err(e) => warn!(entry_id = %entry_id, error = %e, "Scheduled run aborted"),
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_deployment::{InMemoryDeploymentStateStore, ManagerConfig};
    use convoy_platform::InMemoryPlatform;
    use convoy_types::{ClusterId, ContainerSpec, ControlPlaneContext, TaskSpec};
    use std::time::Duration;

    fn dispatcher() -> ManagerDispatcher {
        let manager = DeploymentManager::new(
            Arc::new(InMemoryPlatform::new()),
            Arc::new(InMemoryDeploymentStateStore::new()),
            ManagerConfig::default(),
            ControlPlaneContext::default(),
        );
        ManagerDispatcher::new(
            Arc::new(manager),
            DeploymentParams {
                stable_timeout: Duration::from_secs(120),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_batch_entry_becomes_scheduled_batch_request() {
        let task = TaskSpec::new("scanner").with_container(ContainerSpec::new("scan", "scanner:1"));
        let entry = ScheduleEntry::new(
            "nightly-scan",
            "cron(0 2 * * ? *)",
            ScheduleTarget::RunTask(BatchRun {
                cluster: ClusterId::new("prod"),
                job_name: "image-scan".into(),
                task: task.clone(),
                count: 1,
                attempts: 3,
            }),
        );

        let request = dispatcher().request_for(&entry);
        assert_eq!(request.key, ServiceKey::new("prod", "image-scan"));
        assert_eq!(
            request.strategy,
            Strategy::ScheduledBatch {
                count: 1,
                attempts: 3
            }
        );
        assert_eq!(request.task, task);
        assert_eq!(request.params.stable_timeout, Duration::from_secs(120));
        assert!(!request.params.require_approval);
        assert_eq!(request.requested_by.as_deref(), Some("schedule:nightly-scan"));
    }

    #[test]
    fn test_deployment_entry_is_reissued() {
        let template = DeploymentRequest::new(ServiceKey::new("prod", "web"), Strategy::rolling());
        let entry = ScheduleEntry::new(
            "weekly-refresh",
            "rate(7 days)",
            ScheduleTarget::Deployment {
                request: template.clone(),
            },
        );

        let dispatcher = dispatcher();
        let first = dispatcher.request_for(&entry);
        let second = dispatcher.request_for(&entry);
        assert_ne!(first.id, template.id);
        assert_ne!(first.id, second.id);
        assert_eq!(first.key, template.key);
        assert_eq!(first.strategy, template.strategy);
    }
}
