//! Convoy Scheduler - Recurring deployments and batch runs
//!
//! Entries carry an EventBridge-style `rate(...)`/`cron(...)` or a plain
//! five-field cron expression. The [`Scheduler`] evaluates them minute by
//! minute and hands due entries to a [`ScheduleDispatcher`].

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod expression;
pub mod scheduler;

pub use error::{Result, ScheduleError};
pub use expression::{CronSchedule, ScheduleExpression};
pub use scheduler::{ScheduleDispatcher, Scheduler, SchedulerConfig, TickReport};
