//! Convoy Daemon - Deployment control plane
//!
//! The daemon provides:
//! - Deployment execution against the configured platform
//! - Target-tracking autoscaling loop
//! - rate/cron schedules for recurring deployments and batch runs
//! - Event stream mirrored into the log

use clap::Parser;
use convoy_daemon::{Daemon, DaemonConfig, DaemonError, DaemonResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Convoy Daemon CLI
#[derive(Parser)]
#[command(name = "convoyd")]
#[command(about = "Convoy Daemon - Deployment control plane", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CONVOY_CONFIG")]
    config: Option<String>,

    /// Project name stamped on events
    #[arg(short, long, env = "CONVOY_PROJECT")]
    project: Option<String>,

    /// Log level
    #[arg(long, env = "CONVOY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "CONVOY_LOG_JSON")]
    json: bool,

    /// Disable the autoscaling loop
    #[arg(long)]
    no_autoscaling: bool,

    /// Disable the schedule runner
    #[arg(long)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = DaemonConfig::load(cli.config.as_deref())
        .map_err(|e| DaemonError::Config(e.to_string()))?;

    // Override with CLI args
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json {
        config.logging.json = true;
    }
    if let Some(project) = cli.project {
        config.context.project = project;
    }
    if cli.no_autoscaling {
        config.autoscaling.enabled = false;
    }
    if cli.no_scheduler {
        config.scheduler.enabled = false;
    }

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Print startup banner
    println!(
        r#"
   ___ ___  _ ___   _____   __
  / __/ _ \| '_  \ / / _ \ / /
 | (_| (_) | | | V / (_) \ V /
  \___\___/|_| |_\_/ \___/ |_|

  Convoy - Deployment control plane
  Version: {}
  Project: {} ({}/{})
  Services seeded: {}
"#,
        env!("CARGO_PKG_VERSION"),
        config.context.project,
        config.context.region,
        config.context.environment,
        config.platform.services.len()
    );

    // Wire and run
    let daemon = Daemon::new(config).await?;
    daemon.run().await
}
