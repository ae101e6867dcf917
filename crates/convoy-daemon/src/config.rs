//! Configuration for convoyd
//!
//! Sources are layered: serialized defaults, then an optional file, then
//! `CONVOY_`-prefixed environment variables (`CONVOY_LOGGING__JSON=true`).

use crate::error::{DaemonError, DaemonResult};
use convoy_autoscale::AutoscaleConfig;
use convoy_deployment::{ExecutorConfig, ManagerConfig, DEFAULT_STEP_TIMEOUT};
use convoy_platform::RetryPolicy;
use convoy_scheduler::{ScheduleExpression, SchedulerConfig};
use convoy_types::{
    ControlPlaneContext, DeploymentParams, ScalingPolicy, ScheduleEntry, ServiceKey, TaskDefaults,
    TaskSpec, DEFAULT_APPROVAL_TIMEOUT, DEFAULT_STABLE_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Account, region and project stamped on events
    #[serde(default)]
    pub context: ControlPlaneContext,

    #[serde(default)]
    pub executor: ExecutorSection,

    /// Retry policy for transient platform errors
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub autoscaling: AutoscalingSection,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub platform: PlatformSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Plan execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    /// Interval between DescribeService / DescribeTasks polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Timeout of a single platform call step
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    /// Steady-state wait for requests the daemon builds itself
    #[serde(default = "default_stable_timeout")]
    pub stable_timeout_secs: u64,

    /// Approval wait for requests the daemon builds itself
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,

    #[serde(default)]
    pub task_defaults: TaskDefaults,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            step_timeout_secs: default_step_timeout(),
            stable_timeout_secs: default_stable_timeout(),
            approval_timeout_secs: default_approval_timeout(),
            task_defaults: TaskDefaults::default(),
        }
    }
}

/// Autoscaling loop and the policies attached at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalingSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_autoscale_interval")]
    pub interval_secs: u64,

    #[serde(default)]
    pub policies: Vec<ServicePolicy>,
}

impl Default for AutoscalingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_autoscale_interval(),
            policies: Vec::new(),
        }
    }
}

/// A scaling policy bound to one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePolicy {
    pub cluster: String,
    pub service: String,
    #[serde(default)]
    pub policy: ScalingPolicy,
}

impl ServicePolicy {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.cluster.clone(), self.service.clone())
    }
}

/// Schedule runner and its startup entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Missed minutes older than this are not fired after a late tick
    #[serde(default = "default_catch_up_window")]
    pub catch_up_window_secs: u64,

    #[serde(default)]
    pub entries: Vec<ScheduleEntry>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: default_tick_interval(),
            catch_up_window_secs: default_catch_up_window(),
            entries: Vec::new(),
        }
    }
}

/// In-memory platform backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSection {
    /// DescribeService polls a rollout needs before it settles
    #[serde(default = "default_convergence_polls")]
    pub convergence_polls: u32,

    /// Services running when the daemon starts
    #[serde(default)]
    pub services: Vec<SeedService>,

    /// Listener name to the target group it forwards to
    #[serde(default)]
    pub listeners: BTreeMap<String, String>,
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            convergence_polls: default_convergence_polls(),
            services: Vec::new(),
            listeners: BTreeMap::new(),
        }
    }
}

/// A steady-state service to create on the in-memory platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedService {
    pub cluster: String,
    pub service: String,
    pub task: TaskSpec,
    #[serde(default = "default_revision")]
    pub revision: u32,
    #[serde(default = "default_desired_count")]
    pub desired_count: u32,
}

impl SeedService {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.cluster.clone(), self.service.clone())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    convoy_deployment::DEFAULT_POLL_INTERVAL.as_secs()
}

fn default_step_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT.as_secs()
}

fn default_stable_timeout() -> u64 {
    DEFAULT_STABLE_TIMEOUT.as_secs()
}

fn default_approval_timeout() -> u64 {
    DEFAULT_APPROVAL_TIMEOUT.as_secs()
}

fn default_autoscale_interval() -> u64 {
    60
}

fn default_tick_interval() -> u64 {
    60
}

fn default_catch_up_window() -> u64 {
    60 * 60
}

fn default_convergence_polls() -> u32 {
    1
}

fn default_revision() -> u32 {
    1
}

fn default_desired_count() -> u32 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = Self::defaults()?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder.add_source(Self::environment()).build()?.try_deserialize()
    }

    /// Load configuration from an in-memory document layered over the defaults
    pub fn from_document(contents: &str, format: config::FileFormat) -> Result<Self, config::ConfigError> {
        Self::defaults()?
            .add_source(config::File::from_str(contents, format))
            .build()?
            .try_deserialize()
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        Ok(config::Config::builder().add_source(config::Config::try_from(&DaemonConfig::default())?))
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("CONVOY")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// Reject settings the loops cannot run with
    pub fn validate(&self) -> DaemonResult<()> {
        if self.executor.poll_interval_secs == 0 {
            return Err(DaemonError::Config(
                "executor.poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.autoscaling.interval_secs == 0 {
            return Err(DaemonError::Config(
                "autoscaling.interval_secs must be positive".to_string(),
            ));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(DaemonError::Config(
                "scheduler.tick_interval_secs must be positive".to_string(),
            ));
        }

        for binding in &self.autoscaling.policies {
            binding.policy.validate().map_err(|e| {
                DaemonError::Config(format!("scaling policy for {}: {}", binding.key(), e))
            })?;
        }
        for entry in &self.scheduler.entries {
            ScheduleExpression::parse(&entry.expression)
                .map_err(|e| DaemonError::Config(format!("schedule entry {}: {}", entry.id, e)))?;
        }
        for seed in &self.platform.services {
            seed.task.validate().map_err(|e| {
                DaemonError::Config(format!("seed service {}: {}", seed.key(), e))
            })?;
        }
        Ok(())
    }

    /// Create a development configuration that polls and ticks quickly
    pub fn development() -> Self {
        Self {
            executor: ExecutorSection {
                poll_interval_secs: 1,
                ..Default::default()
            },
            autoscaling: AutoscalingSection {
                interval_secs: 10,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            executor: ExecutorConfig {
                poll_interval: Duration::from_secs(self.executor.poll_interval_secs),
                retry: self.retry.clone(),
            },
            defaults: self.executor.task_defaults,
            step_timeout: Duration::from_secs(self.executor.step_timeout_secs),
        }
    }

    pub fn autoscale_config(&self) -> AutoscaleConfig {
        AutoscaleConfig {
            interval: Duration::from_secs(self.autoscaling.interval_secs),
            retry: self.retry.clone(),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(self.scheduler.tick_interval_secs),
            catch_up_window: Duration::from_secs(self.scheduler.catch_up_window_secs),
        }
    }

    /// Parameters of batch-run requests built from schedule entries
    pub fn batch_params(&self) -> DeploymentParams {
        DeploymentParams {
            require_approval: false,
            approval_timeout: Duration::from_secs(self.executor.approval_timeout_secs),
            stable_timeout: Duration::from_secs(self.executor.stable_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.executor.poll_interval_secs, 15);
        assert_eq!(config.executor.step_timeout_secs, 600);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.autoscaling.enabled);
        assert!(config.scheduler.entries.is_empty());
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_manager_config_mapping() {
        let mut config = DaemonConfig::default();
        config.executor.poll_interval_secs = 5;
        config.executor.step_timeout_secs = 30;
        config.retry.max_attempts = 7;

        let manager = config.manager_config();
        assert_eq!(manager.executor.poll_interval, Duration::from_secs(5));
        assert_eq!(manager.executor.retry.max_attempts, 7);
        assert_eq!(manager.step_timeout, Duration::from_secs(30));
        assert_eq!(config.autoscale_config().retry.max_attempts, 7);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let toml = r#"
            [context]
            project = "payments"

            [executor]
            poll_interval_secs = 2

            [scheduler]
            catch_up_window_secs = 120
        "#;

        let config = DaemonConfig::from_document(toml, FileFormat::Toml).unwrap();
        assert_eq!(config.context.project, "payments");
        assert_eq!(config.context.region, "local");
        assert_eq!(config.executor.poll_interval_secs, 2);
        assert_eq!(config.executor.stable_timeout_secs, 600);
        assert_eq!(config.scheduler.catch_up_window_secs, 120);
        assert_eq!(config.scheduler.tick_interval_secs, 60);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = DaemonConfig::default();
        config.scheduler.tick_interval_secs = 0;
        assert!(matches!(config.validate(), Err(DaemonError::Config(_))));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let mut config = DaemonConfig::default();
        config.autoscaling.policies.push(ServicePolicy {
            cluster: "prod".into(),
            service: "web".into(),
            policy: ScalingPolicy::new(5, 2),
        });
        assert!(matches!(config.validate(), Err(DaemonError::Config(_))));
    }

    #[test]
    fn test_development_config() {
        let config = DaemonConfig::development();
        assert_eq!(config.executor.poll_interval_secs, 1);
        assert_eq!(config.autoscaling.interval_secs, 10);
    }
}
