//! Convoy Autoscale - Target-tracking capacity management
//!
//! [`ScalingEngine`] turns metric samples into capacity decisions;
//! [`AutoscaleController`] runs it periodically against the platform for every
//! service with a registered [`ScalingPolicy`](convoy_types::ScalingPolicy).

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod controller;
pub mod engine;
pub mod error;

pub use controller::{AutoscaleConfig, AutoscaleController};
pub use engine::{desired_capacity, ScalingEngine};
pub use error::{AutoscaleError, Result};
