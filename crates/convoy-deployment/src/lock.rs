//! Per-service deployment locks
//!
//! At most one plan may be in flight per service. A second submission fails
//! immediately instead of queueing.

use crate::error::{DeploymentError, Result};
use convoy_types::{DeploymentId, ServiceKey};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry of services with a deployment in flight
#[derive(Clone, Default)]
pub struct ServiceLocks {
    held: Arc<DashMap<ServiceKey, DeploymentId>>,
}

impl ServiceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key` on behalf of `deployment_id`
    pub fn try_acquire(&self, key: &ServiceKey, deployment_id: &DeploymentId) -> Result<ServiceLockGuard> {
        match self.held.entry(key.clone()) {
            Entry::Occupied(holder) => Err(DeploymentError::conflict(
                key,
                format!("{} is already in flight", holder.get()),
            )),
            Entry::Vacant(slot) => {
                slot.insert(deployment_id.clone());
                debug!(service = %key, deployment_id = %deployment_id, "Service lock acquired");
                Ok(ServiceLockGuard {
                    held: self.held.clone(),
                    key: key.clone(),
                    deployment_id: deployment_id.clone(),
                })
            }
        }
    }

    /// Deployment currently holding the lock for `key`
    pub fn holder(&self, key: &ServiceKey) -> Option<DeploymentId> {
        self.held.get(key).map(|id| id.clone())
    }

    pub fn is_locked(&self, key: &ServiceKey) -> bool {
        self.held.contains_key(key)
    }
}

/// Releases the service lock when dropped
pub struct ServiceLockGuard {
    held: Arc<DashMap<ServiceKey, DeploymentId>>,
    key: ServiceKey,
    deployment_id: DeploymentId,
}

impl ServiceLockGuard {
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }
}

impl Drop for ServiceLockGuard {
    fn drop(&mut self) {
        self.held
            .remove_if(&self.key, |_, holder| holder == &self.deployment_id);
        debug!(service = %self.key, deployment_id = %self.deployment_id, "Service lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_conflicts() {
        let locks = ServiceLocks::new();
        let key = ServiceKey::new("prod", "web");
        let first = DeploymentId::generate();

        let guard = locks.try_acquire(&key, &first).unwrap();
        let err = locks
            .try_acquire(&key, &DeploymentId::generate())
            .err()
            .unwrap();
        assert!(matches!(err, DeploymentError::ConflictingDeployment { .. }));
        assert_eq!(locks.holder(&key), Some(first));

        drop(guard);
        assert!(!locks.is_locked(&key));
        assert!(locks.try_acquire(&key, &DeploymentId::generate()).is_ok());
    }

    #[test]
    fn test_locks_are_per_service() {
        let locks = ServiceLocks::new();
        let _web = locks
            .try_acquire(&ServiceKey::new("prod", "web"), &DeploymentId::generate())
            .unwrap();
        assert!(locks
            .try_acquire(&ServiceKey::new("prod", "api"), &DeploymentId::generate())
            .is_ok());
    }
}
