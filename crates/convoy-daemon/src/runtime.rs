//! Daemon lifecycle: wiring, background loops and shutdown

use crate::config::DaemonConfig;
use crate::dispatcher::ManagerDispatcher;
use crate::error::{DaemonError, DaemonResult};
use convoy_autoscale::AutoscaleController;
use convoy_deployment::{DeploymentManager, InMemoryDeploymentStateStore};
use convoy_platform::InMemoryPlatform;
use convoy_scheduler::Scheduler;
use convoy_types::{ConvoyEventEnvelope, EventSeverity};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A fully wired control plane
pub struct Daemon {
    config: DaemonConfig,
    platform: Arc<InMemoryPlatform>,
    manager: Arc<DeploymentManager>,
    autoscaler: Arc<AutoscaleController>,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Build every component from `config` and seed the in-memory platform
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        config.validate()?;

        // 1. Platform with its seed services
        let platform = Arc::new(
            InMemoryPlatform::new().with_convergence_polls(config.platform.convergence_polls),
        );
        for seed in &config.platform.services {
            let revision = platform.seed_revision(seed.task.clone(), seed.revision)?;
            platform.seed_service(seed.key(), revision, None, seed.desired_count)?;
            tracing::debug!(service = %seed.key(), "Seeded service");
        }
        for (listener, target_group) in &config.platform.listeners {
            platform.seed_listener(listener.clone(), target_group.clone());
        }

        // 2. Deployment manager owns the event stream
        let manager = Arc::new(DeploymentManager::new(
            platform.clone(),
            Arc::new(InMemoryDeploymentStateStore::new()),
            config.manager_config(),
            config.context.clone(),
        ));

        // 3. Autoscaler and scheduler publish on the same stream
        let autoscaler = Arc::new(AutoscaleController::new(
            platform.clone(),
            config.autoscale_config(),
            manager.event_sender(),
            config.context.clone(),
        ));
        for binding in &config.autoscaling.policies {
            autoscaler
                .register(binding.key(), binding.policy.clone())
                .await?;
        }

        let dispatcher = Arc::new(ManagerDispatcher::new(
            manager.clone(),
            config.batch_params(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            dispatcher,
            config.scheduler_config(),
            manager.event_sender(),
            config.context.clone(),
        ));
        for entry in &config.scheduler.entries {
            scheduler.add(entry.clone())?;
        }

        Ok(Self {
            config,
            platform,
            manager,
            autoscaler,
            scheduler,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn platform(&self) -> &Arc<InMemoryPlatform> {
        &self.platform
    }

    pub fn manager(&self) -> &Arc<DeploymentManager> {
        &self.manager
    }

    pub fn autoscaler(&self) -> &Arc<AutoscaleController> {
        &self.autoscaler
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Token that stops the daemon when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until Ctrl+C or SIGTERM
    pub async fn run(self) -> DaemonResult<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the background loops until `signal` resolves or the shutdown
    /// token is cancelled
    pub async fn run_until<F>(self, signal: F) -> DaemonResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        tasks.push((
            "event-log",
            tokio::spawn(log_events(self.manager.subscribe(), self.shutdown.clone())),
        ));
        if self.config.autoscaling.enabled {
            tasks.push((
                "autoscaler",
                tokio::spawn(self.autoscaler.clone().run(self.shutdown.child_token())),
            ));
        }
        if self.config.scheduler.enabled {
            tasks.push((
                "scheduler",
                tokio::spawn(self.scheduler.clone().run(self.shutdown.child_token())),
            ));
        }

        tracing::info!(
            project = %self.config.context.project,
            environment = %self.config.context.environment,
            policies = self.autoscaler.registered().len(),
            schedules = self.scheduler.entries().len(),
            "Convoy daemon started"
        );

        tokio::select! {
            _ = signal => {}
            _ = self.shutdown.cancelled() => {}
        }

        tracing::info!("Convoy daemon shutting down");
        self.shutdown.cancel();

        // In-flight deployments stop at their next cancellation point
        self.manager.cancel_all();

        let mut first_error = None;
        for (name, task) in tasks {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "Background task panicked");
                first_error.get_or_insert(DaemonError::Task(format!("{}: {}", name, e)));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Mirror the event stream into the log
async fn log_events(
    mut rx: broadcast::Receiver<ConvoyEventEnvelope>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(envelope) => log_event(&envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log lagging behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }
}

fn log_event(envelope: &ConvoyEventEnvelope) {
    let event = match serde_json::to_string(&envelope.event) {
        Ok(json) => json,
        Err(_) => format!("{:?}", envelope.event),
    };
    let correlation_id = envelope.correlation_id.as_deref().unwrap_or("-");

    match envelope.severity {
        EventSeverity::Debug => {
            tracing::debug!(source = ?envelope.source, correlation_id, %event, "event")
        }
        EventSeverity::Info => {
            tracing::info!(source = ?envelope.source, correlation_id, %event, "event")
        }
        EventSeverity::Warning => {
            tracing::warn!(source = ?envelope.source, correlation_id, %event, "event")
        }
        EventSeverity::Error | EventSeverity::Critical => {
            tracing::error!(source = ?envelope.source, correlation_id, %event, "event")
        }
    }
}

/// Graceful shutdown signal handler
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
