//! Convoy Deployment Engine
//!
//! Turns deployment requests into guarded platform plans and executes them.
//!
//! ## Pipeline
//!
//! - [`DesiredStateResolver`] merges a partial request with the running service
//! - [`StrategySelector`] expands the target state into a [`DeploymentPlan`]
//!   for the requested strategy and inserts the approval gate
//! - [`DeploymentExecutor`] runs the plan step by step against a
//!   [`PlatformClient`](convoy_platform::PlatformClient)
//!
//! [`DeploymentManager`] wires these together, holds the per-service locks and
//! publishes the event stream.
//!
//! ## Usage
//!
//! ```no_run
//! use convoy_deployment::{DeploymentManager, ManagerConfig};
//! use convoy_deployment::state::InMemoryDeploymentStateStore;
//! use convoy_platform::InMemoryPlatform;
//! use convoy_types::{ControlPlaneContext, DeploymentRequest, ServiceKey, Strategy, TaskSpec};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = DeploymentManager::new(
//!     Arc::new(InMemoryPlatform::new()),
//!     Arc::new(InMemoryDeploymentStateStore::new()),
//!     ManagerConfig::default(),
//!     ControlPlaneContext::default(),
//! );
//!
//! let request = DeploymentRequest::new(ServiceKey::new("prod", "web"), Strategy::rolling())
//!     .with_task(TaskSpec::new("app"));
//! let result = manager.deploy(request).await?;
//! println!("{}", result.state);
//! # Ok(())
//! # }
//! ```
//!
//! [`DeploymentPlan`]: convoy_types::DeploymentPlan

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod approval;
pub mod error;
pub mod executor;
pub mod lock;
pub mod manager;
pub mod resolver;
pub mod selector;
pub mod state;
pub mod strategies;

pub use approval::{ApprovalDecision, ApprovalRegistry};
pub use error::{DeploymentError, Result};
pub use executor::{DeploymentExecutor, DeploymentResult, ExecutorConfig, DEFAULT_POLL_INTERVAL};
pub use lock::{ServiceLockGuard, ServiceLocks};
pub use manager::{DeploymentHandle, DeploymentManager, ManagerConfig};
pub use resolver::{DesiredStateResolver, TargetState};
pub use selector::{StrategySelector, DEFAULT_STEP_TIMEOUT};
pub use state::{DeploymentStateStore, InMemoryDeploymentStateStore, StateStoreError};
pub use strategies::{create_planner, StepPlanner};
