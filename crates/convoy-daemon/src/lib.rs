//! Convoy Daemon library
//!
//! This module provides the pieces `convoyd` is assembled from:
//! - Layered configuration
//! - Schedule dispatch into the deployment manager
//! - Component wiring, background loops and graceful shutdown

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod runtime;

pub use config::DaemonConfig;
pub use dispatcher::ManagerDispatcher;
pub use error::{DaemonError, DaemonResult};
pub use runtime::{shutdown_signal, Daemon};
