//! Manual approval gates
//!
//! A suspended plan opens a gate keyed by its deployment ID and waits on a
//! watch channel for a decision.

use crate::error::{DeploymentError, Result};
use convoy_types::DeploymentId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Human decision on a gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalDecision {
    Approved { approver: String },
    Rejected { approver: String, reason: String },
}

/// Open approval gates
#[derive(Default)]
pub struct ApprovalRegistry {
    pending: DashMap<DeploymentId, watch::Sender<Option<ApprovalDecision>>>,
}

impl ApprovalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a gate for `id` and return the receiver to wait on
    pub fn open(&self, id: &DeploymentId) -> watch::Receiver<Option<ApprovalDecision>> {
        let (tx, rx) = watch::channel(None);
        self.pending.insert(id.clone(), tx);
        rx
    }

    /// Record a decision for an open gate
    pub fn decide(&self, id: &DeploymentId, decision: ApprovalDecision) -> Result<()> {
        let gate = self
            .pending
            .get(id)
            .ok_or_else(|| DeploymentError::NotFound(format!("approval gate for {}", id)))?;
        gate.send_replace(Some(decision));
        Ok(())
    }

    pub fn close(&self, id: &DeploymentId) {
        self.pending.remove(id);
    }

    pub fn is_pending(&self, id: &DeploymentId) -> bool {
        self.pending.contains_key(id)
    }
}

/// Wait until a decision is available; `None` if the gate was closed first
pub async fn wait_for_decision(
    rx: &mut watch::Receiver<Option<ApprovalDecision>>,
) -> Option<ApprovalDecision> {
    loop {
        if let Some(decision) = rx.borrow_and_update().clone() {
            return Some(decision);
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_decision_reaches_waiter() {
        let registry = ApprovalRegistry::new();
        let id = DeploymentId::generate();
        let mut rx = registry.open(&id);

        registry
            .decide(
                &id,
                ApprovalDecision::Approved {
                    approver: "ops".into(),
                },
            )
            .unwrap();

        let decision = wait_for_decision(&mut rx).await;
        assert_eq!(
            decision,
            Some(ApprovalDecision::Approved {
                approver: "ops".into()
            })
        );
    }

    #[test]
    fn test_decide_without_gate() {
        let registry = ApprovalRegistry::new();
        assert!(matches!(
            registry.decide(
                &DeploymentId::generate(),
                ApprovalDecision::Approved {
                    approver: "ops".into()
                }
            ),
            Err(DeploymentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_gate_yields_none() {
        let registry = ApprovalRegistry::new();
        let id = DeploymentId::generate();
        let mut rx = registry.open(&id);
        registry.close(&id);
        assert_eq!(wait_for_decision(&mut rx).await, None);
    }
}
