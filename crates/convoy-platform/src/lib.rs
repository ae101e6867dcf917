//! Convoy Platform - Container platform client contract
//!
//! The control plane never talks to a platform directly; it goes through the
//! [`PlatformClient`] trait defined here. Errors are classified as transient
//! (retried with [`RetryPolicy`]) or permanent.
//!
//! [`InMemoryPlatform`] simulates a platform for development and tests.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod client;
pub mod error;
pub mod memory;
pub mod retry;

pub use client::{
    CreateServiceInput, PlatformClient, RunTaskInput, TaskLifecycle, TaskStatus,
    UpdateServiceInput,
};
pub use error::{PlatformError, Result};
pub use memory::{InMemoryPlatform, RolloutOutcome};
pub use retry::RetryPolicy;
