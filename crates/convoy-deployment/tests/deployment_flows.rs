//! End-to-end deployment flows against the in-memory platform

use convoy_deployment::{
    DeploymentError, DeploymentManager, InMemoryDeploymentStateStore, ManagerConfig,
};
use convoy_platform::{
    InMemoryPlatform, PlatformClient, PlatformError, RolloutOutcome, UpdateServiceInput,
};
use convoy_types::{
    ContainerSpec, ControlPlaneContext, ConvoyEvent, ConvoyEventEnvelope, DependencyCondition,
    DeploymentState, DeploymentRequest, ScalingPolicy, ServiceKey, StepStatus, Strategy,
    TaskDefinitionRevision, TaskSpec, TrafficShift,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn web() -> ServiceKey {
    ServiceKey::new("prod", "web")
}

fn app_spec(image: &str) -> TaskSpec {
    TaskSpec::new("app")
        .with_cpu(256)
        .with_memory(512)
        .with_container(ContainerSpec::new("app", image).with_port(80))
}

fn setup(platform: InMemoryPlatform) -> (Arc<InMemoryPlatform>, DeploymentManager) {
    let platform = Arc::new(platform);
    let manager = DeploymentManager::new(
        platform.clone(),
        Arc::new(InMemoryDeploymentStateStore::new()),
        ManagerConfig::default(),
        ControlPlaneContext::default(),
    );
    (platform, manager)
}

/// Platform with `prod/web` running app:1 at two tasks
fn seeded() -> (Arc<InMemoryPlatform>, DeploymentManager) {
    let platform = InMemoryPlatform::new();
    let v1 = platform.seed_revision(app_spec("app:v1"), 1).unwrap();
    platform.seed_service(web(), v1, None, 2).unwrap();
    setup(platform)
}

async fn wait_for_gate(events: &mut broadcast::Receiver<ConvoyEventEnvelope>) {
    loop {
        let envelope = events.recv().await.unwrap();
        if matches!(envelope.event, ConvoyEvent::ApprovalRequired { .. }) {
            return;
        }
    }
}

async fn wait_for_step_start(events: &mut broadcast::Receiver<ConvoyEventEnvelope>, name: &str) {
    loop {
        let envelope = events.recv().await.unwrap();
        if let ConvoyEvent::StepStarted { step, .. } = &envelope.event {
            if step == name {
                return;
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn normal_deployment_reaches_desired_count() {
    let (platform, manager) = seeded();
    let request = DeploymentRequest::new(web(), Strategy::Normal)
        .with_task(TaskSpec::new("app").with_container(ContainerSpec::new("app", "app:v2")))
        .with_desired_count(3);

    let handle = manager.submit(request).await.unwrap();
    assert_eq!(
        handle.plan.step_names(),
        vec!["register_task_definition", "update_service", "wait_for_stable"]
    );

    let result = handle.wait().await.unwrap();
    assert_eq!(result.state, DeploymentState::Succeeded);
    assert_eq!(result.service.running_count, 3);
    assert_eq!(result.service.desired_count, 3);
    assert_eq!(result.service.pending_count, 0);
    assert_eq!(
        result.registered_revision,
        Some(TaskDefinitionRevision::new("app", 2))
    );
    assert!(result.forward_steps().all(|s| s.status == StepStatus::Succeeded));
    assert_eq!(
        manager.revision_history(&web()).await.unwrap(),
        vec![
            TaskDefinitionRevision::new("app", 1),
            TaskDefinitionRevision::new("app", 2)
        ]
    );
    assert!(!manager.is_deploying(&web()));
    assert_eq!(platform.revision_count("app"), 2);
}

#[tokio::test(start_paused = true)]
async fn rollback_moves_service_to_explicit_revision() {
    let platform = InMemoryPlatform::new();
    let v7 = platform.seed_revision(app_spec("app:v7"), 7).unwrap();
    let v9 = platform.seed_revision(app_spec("app:v9"), 9).unwrap();
    platform.seed_service(web(), v9, None, 2).unwrap();
    let (platform, manager) = setup(platform);

    let target: TaskDefinitionRevision = "app:7".parse().unwrap();
    let request = DeploymentRequest::new(
        web(),
        Strategy::Rollback {
            target_revision: Some(target.clone()),
        },
    );

    let handle = manager.submit(request).await.unwrap();
    assert_eq!(
        handle.plan.step_names(),
        vec!["update_service", "wait_for_stable"]
    );

    let result = handle.wait().await.unwrap();
    assert_eq!(result.state, DeploymentState::Succeeded);
    assert_eq!(result.service.current_revision, Some(v7));
    assert_eq!(result.registered_revision, None);
    assert_eq!(platform.call_count("register_task_definition"), 0);
}

#[tokio::test(start_paused = true)]
async fn rollback_without_target_uses_previous_revision() {
    let (_platform, manager) = seeded();
    manager
        .deploy(DeploymentRequest::new(web(), Strategy::Normal).with_task(app_spec("app:v2")))
        .await
        .unwrap();

    let result = manager
        .deploy(DeploymentRequest::new(
            web(),
            Strategy::Rollback {
                target_revision: None,
            },
        ))
        .await
        .unwrap();

    assert_eq!(result.state, DeploymentState::Succeeded);
    assert_eq!(
        result.service.current_revision,
        Some(TaskDefinitionRevision::new("app", 1))
    );
}

#[tokio::test(start_paused = true)]
async fn circuit_breaker_during_rolling_update_is_rolled_back() {
    let (platform, manager) = seeded();
    platform.script_rollout(web(), RolloutOutcome::TripCircuitBreaker);
    let mut events = manager.subscribe();

    let result = manager
        .deploy(DeploymentRequest::new(web(), Strategy::rolling()).with_task(app_spec("app:v2")))
        .await
        .unwrap();

    assert_eq!(result.state, DeploymentState::RolledBack);
    assert_ne!(result.state, DeploymentState::Failed);
    assert!(matches!(
        result.error,
        Some(DeploymentError::CircuitBreakerTripped { .. })
    ));
    assert_eq!(result.failed_step, Some(2));
    assert_eq!(
        result.service.current_revision,
        Some(TaskDefinitionRevision::new("app", 1))
    );
    // The platform already reverted; no compensating steps run
    assert_eq!(result.rollback_steps().count(), 0);

    let mut tripped = false;
    while let Ok(envelope) = events.try_recv() {
        tripped |= matches!(envelope.event, ConvoyEvent::CircuitBreakerTripped { .. });
    }
    assert!(tripped);
}

#[tokio::test(start_paused = true)]
async fn stalled_rolling_update_runs_rollback_plan() {
    let (platform, manager) = seeded();
    platform.script_rollout(web(), RolloutOutcome::Stall);

    let result = manager
        .deploy(
            DeploymentRequest::new(web(), Strategy::rolling())
                .with_task(app_spec("app:v2"))
                .with_stable_timeout(Duration::from_secs(120)),
        )
        .await
        .unwrap();

    assert_eq!(result.state, DeploymentState::RolledBack);
    assert!(matches!(result.error, Some(DeploymentError::Timeout { .. })));
    assert_eq!(result.failed_step, Some(2));
    let rollback: Vec<_> = result.rollback_steps().collect();
    assert_eq!(rollback.len(), 2);
    assert!(rollback.iter().all(|s| s.status == StepStatus::Succeeded));
    assert_eq!(
        result.service.current_revision,
        Some(TaskDefinitionRevision::new("app", 1))
    );
}

#[tokio::test(start_paused = true)]
async fn second_submission_conflicts_without_disturbing_first() {
    let (_platform, manager) = seeded();
    let mut events = manager.subscribe();

    let first = manager
        .submit(
            DeploymentRequest::new(web(), Strategy::Normal)
                .with_task(app_spec("app:v2"))
                .with_approval(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
    wait_for_gate(&mut events).await;

    let err = manager
        .submit(DeploymentRequest::new(web(), Strategy::Normal).with_task(app_spec("app:v3")))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, DeploymentError::ConflictingDeployment { .. }));
    assert_eq!(
        manager.status(&first.id).await.unwrap(),
        DeploymentState::AwaitingApproval
    );

    manager.approve(&first.id, "alice").unwrap();
    let result = first.wait().await.unwrap();
    assert_eq!(result.state, DeploymentState::Succeeded);
    assert_eq!(
        result.service.current_revision,
        Some(TaskDefinitionRevision::new("app", 2))
    );
}

#[tokio::test(start_paused = true)]
async fn approval_timeout_before_any_change_expires() {
    let (platform, manager) = seeded();

    let result = manager
        .deploy(
            DeploymentRequest::new(web(), Strategy::Normal)
                .with_task(app_spec("app:v2"))
                .with_approval(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    assert_eq!(result.state, DeploymentState::Expired);
    assert!(matches!(result.error, Some(DeploymentError::ApprovalExpired(_))));
    assert_eq!(platform.call_count("update_service"), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_approval_fails_without_changes() {
    let (platform, manager) = seeded();
    let mut events = manager.subscribe();

    let handle = manager
        .submit(
            DeploymentRequest::new(web(), Strategy::rolling())
                .with_task(app_spec("app:v2"))
                .with_approval(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
    wait_for_gate(&mut events).await;

    manager.reject(&handle.id, "bob", "freeze window").unwrap();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.state, DeploymentState::Failed);
    assert_eq!(result.failed_step, Some(1));
    match result.error {
        Some(DeploymentError::ApprovalRejected { approver, reason }) => {
            assert_eq!(approver, "bob");
            assert_eq!(reason, "freeze window");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(platform.call_count("update_service"), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_awaiting_approval() {
    let (platform, manager) = seeded();
    let mut events = manager.subscribe();

    let handle = manager
        .submit(
            DeploymentRequest::new(web(), Strategy::Normal)
                .with_task(app_spec("app:v2"))
                .with_approval(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
    wait_for_gate(&mut events).await;

    manager.cancel(&handle.id).unwrap();
    let id = handle.id.clone();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.state, DeploymentState::Failed);
    assert!(matches!(result.error, Some(DeploymentError::Cancelled)));
    assert_eq!(platform.call_count("update_service"), 0);
    assert!(manager.cancel(&id).is_err());
}

#[tokio::test(start_paused = true)]
async fn rollout_started_while_gate_open_blocks_update() {
    let platform = InMemoryPlatform::new().with_convergence_polls(50);
    let v1 = platform.seed_revision(app_spec("app:v1"), 1).unwrap();
    platform.seed_service(web(), v1.clone(), None, 2).unwrap();
    let (platform, manager) = setup(platform);
    let mut events = manager.subscribe();

    let handle = manager
        .submit(
            DeploymentRequest::new(web(), Strategy::Normal)
                .with_task(app_spec("app:v2"))
                .with_approval(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
    wait_for_gate(&mut events).await;

    // Another actor forces a rollout while the deployment waits for approval
    let forced = UpdateServiceInput {
        force_new_deployment: true,
        ..UpdateServiceInput::default()
    };
    let record = platform.update_service(&web(), &forced).await.unwrap();
    assert!(record.has_deployment_in_flight());

    manager.approve(&handle.id, "alice").unwrap();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.state, DeploymentState::Failed);
    assert_eq!(result.failed_step, Some(2));
    assert!(matches!(
        result.error,
        Some(DeploymentError::ConflictingDeployment { .. })
    ));
    // Only the forced rollout reached the platform
    assert_eq!(platform.call_count("update_service"), 1);
    assert_eq!(result.service.current_revision, Some(v1));
    assert_eq!(result.rollback_steps().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_update_stops_before_waiting() {
    let platform = InMemoryPlatform::new().with_convergence_polls(5);
    let v1 = platform.seed_revision(app_spec("app:v1"), 1).unwrap();
    platform.seed_service(web(), v1, None, 2).unwrap();
    let (platform, manager) = setup(platform);
    // The retry backoff keeps UpdateService in progress while the cancel lands
    platform.fail_next(
        "update_service",
        PlatformError::transient("update_service", "throttled"),
    );
    let mut events = manager.subscribe();

    let handle = manager
        .submit(DeploymentRequest::new(web(), Strategy::rolling()).with_task(app_spec("app:v2")))
        .await
        .unwrap();
    wait_for_step_start(&mut events, "update_service").await;

    manager.cancel(&handle.id).unwrap();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.state, DeploymentState::Failed);
    assert!(matches!(result.error, Some(DeploymentError::Cancelled)));
    assert_eq!(result.failed_step, Some(2));

    // The dispatched update stands
    let update = result.steps.iter().find(|s| s.step == "update_service").unwrap();
    assert_eq!(update.status, StepStatus::Succeeded);
    assert_eq!(update.attempts, 2);
    assert_eq!(
        result.service.current_revision,
        Some(TaskDefinitionRevision::new("app", 2))
    );
    assert!(result.service.has_deployment_in_flight());

    // Nothing waited on the rollout and nothing was reverted
    assert!(result.steps.iter().all(|s| s.step != "wait_for_stable"));
    assert_eq!(result.rollback_steps().count(), 0);
    assert_eq!(platform.call_count("update_service"), 2);
}

#[tokio::test(start_paused = true)]
async fn sidecars_are_registered_in_startup_order() {
    let (platform, manager) = seeded();
    let spec = TaskSpec::new("app")
        .with_cpu(512)
        .with_memory(1024)
        .with_container(
            ContainerSpec::new("app", "app:v2")
                .with_port(80)
                .depends_on("envoy", DependencyCondition::Healthy)
                .depends_on("migrate", DependencyCondition::Success),
        )
        .with_container(ContainerSpec::new("envoy", "envoy:1.29").non_essential())
        .with_container(ContainerSpec::new("migrate", "app:v2").non_essential());

    let result = manager
        .deploy(DeploymentRequest::new(web(), Strategy::Normal).with_task(spec))
        .await
        .unwrap();
    assert_eq!(result.state, DeploymentState::Succeeded);

    let revision = result.registered_revision.unwrap();
    let registered = platform.describe_task_definition(&revision).await.unwrap();
    let names: Vec<&str> = registered
        .containers
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(names, vec!["envoy", "migrate", "app"]);
}

#[tokio::test(start_paused = true)]
async fn hotfix_never_waits_for_approval() {
    let (_platform, manager) = seeded();

    let result = manager
        .deploy(
            DeploymentRequest::new(
                web(),
                Strategy::Hotfix {
                    image: "app:v1-fix".into(),
                    container: None,
                },
            )
            .with_approval(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    assert_eq!(result.state, DeploymentState::Succeeded);
    assert!(result.forward_steps().all(|s| s.step != "manual_approval_gate"));
    let spec = result.service.task_spec.unwrap();
    assert_eq!(
        spec.container("app").unwrap().image.as_deref(),
        Some("app:v1-fix")
    );
}

#[tokio::test(start_paused = true)]
async fn blue_green_switches_listener_and_retires_blue() {
    let platform = InMemoryPlatform::new();
    let v1 = platform.seed_revision(app_spec("app:v1"), 1).unwrap();
    platform.seed_service(web(), v1.clone(), None, 2).unwrap();
    platform.seed_listener("listener-443", "tg-blue");
    let (platform, manager) = setup(platform);

    let strategy = Strategy::BlueGreen {
        traffic: TrafficShift {
            listener: "listener-443".into(),
            blue_target_group: "tg-blue".into(),
            green_target_group: "tg-green".into(),
        },
        green_service: None,
    };
    let result = manager
        .deploy(DeploymentRequest::new(web(), strategy).with_task(app_spec("app:v2")))
        .await
        .unwrap();

    assert_eq!(result.state, DeploymentState::Succeeded);
    assert_eq!(result.service.key, ServiceKey::new("prod", "web-green"));
    assert_eq!(
        platform.listener_target("listener-443").as_deref(),
        Some("tg-green")
    );
    assert_eq!(
        platform
            .service_target_group(&ServiceKey::new("prod", "web-green"))
            .as_deref(),
        Some("tg-green")
    );
    assert!(!platform.is_revision_active(&v1));
}

#[tokio::test(start_paused = true)]
async fn blue_green_guard_rejects_listener_on_wrong_group() {
    let platform = InMemoryPlatform::new();
    let v1 = platform.seed_revision(app_spec("app:v1"), 1).unwrap();
    platform.seed_service(web(), v1, None, 2).unwrap();
    platform.seed_listener("listener-443", "tg-other");
    let (platform, manager) = setup(platform);

    let strategy = Strategy::BlueGreen {
        traffic: TrafficShift {
            listener: "listener-443".into(),
            blue_target_group: "tg-blue".into(),
            green_target_group: "tg-green".into(),
        },
        green_service: None,
    };
    let result = manager
        .deploy(DeploymentRequest::new(web(), strategy).with_task(app_spec("app:v2")))
        .await
        .unwrap();

    assert_eq!(result.state, DeploymentState::Failed);
    assert_eq!(result.failed_step, Some(3));
    assert!(matches!(
        result.error,
        Some(DeploymentError::ConflictingDeployment { .. })
    ));
    assert!(result.steps.is_empty());
    assert!(platform.mutating_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn scheduled_batch_retries_failed_run() {
    let (platform, manager) = setup(InMemoryPlatform::new());
    let key = ServiceKey::new("batch", "image-scan");
    platform.script_exit_codes("image-scan", vec![1, 0]);

    let request = DeploymentRequest::new(
        key,
        Strategy::ScheduledBatch {
            count: 1,
            attempts: 2,
        },
    )
    .with_task(TaskSpec::new("scan").with_container(ContainerSpec::new("scan", "scanner:latest")));

    let result = manager.deploy(request).await.unwrap();
    assert_eq!(result.state, DeploymentState::Succeeded);
    assert_eq!(result.task_ids.len(), 2);
    assert_eq!(platform.call_count("run_task"), 2);
}

#[tokio::test(start_paused = true)]
async fn scheduled_batch_fails_after_last_attempt() {
    let (platform, manager) = setup(InMemoryPlatform::new());
    platform.script_exit_codes("image-scan", vec![2]);

    let request = DeploymentRequest::new(
        ServiceKey::new("batch", "image-scan"),
        Strategy::ScheduledBatch {
            count: 1,
            attempts: 1,
        },
    )
    .with_task(TaskSpec::new("scan").with_container(ContainerSpec::new("scan", "scanner:latest")));

    let result = manager.deploy(request).await.unwrap();
    assert_eq!(result.state, DeploymentState::Failed);
    assert!(matches!(
        result.error,
        Some(DeploymentError::TaskRunFailed { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried() {
    let (platform, manager) = seeded();
    platform.fail_next(
        "register_task_definition",
        PlatformError::transient("register_task_definition", "throttled"),
    );

    let result = manager
        .deploy(DeploymentRequest::new(web(), Strategy::Normal).with_task(app_spec("app:v2")))
        .await
        .unwrap();

    assert_eq!(result.state, DeploymentState::Succeeded);
    assert_eq!(result.steps[0].attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn permanent_errors_fail_the_step() {
    let (platform, manager) = seeded();
    platform.fail_next(
        "update_service",
        PlatformError::permanent("update_service", "access denied"),
    );

    let result = manager
        .deploy(DeploymentRequest::new(web(), Strategy::rolling()).with_task(app_spec("app:v2")))
        .await
        .unwrap();

    assert_eq!(result.state, DeploymentState::Failed);
    assert_eq!(result.failed_step, Some(1));
    assert_eq!(result.steps[1].attempts, 1);
    assert!(matches!(
        result.error,
        Some(DeploymentError::PlatformPermanent { .. })
    ));
    // Nothing was changed, so the rollback plan is not run
    assert_eq!(result.rollback_steps().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn identical_spec_registers_once() {
    let (platform, manager) = seeded();

    let first = manager
        .deploy(DeploymentRequest::new(web(), Strategy::Normal).with_task(app_spec("app:v2")))
        .await
        .unwrap();
    let second = manager
        .deploy(DeploymentRequest::new(web(), Strategy::Normal).with_task(app_spec("app:v2")))
        .await
        .unwrap();

    assert_eq!(first.registered_revision, second.registered_revision);
    assert_eq!(platform.revision_count("app"), 2);
    assert_eq!(second.state, DeploymentState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn scaling_policy_is_attached_after_success() {
    let (platform, manager) = seeded();

    manager
        .deploy(
            DeploymentRequest::new(web(), Strategy::Normal)
                .with_task(app_spec("app:v2"))
                .with_scaling_policy(ScalingPolicy::new(2, 8)),
        )
        .await
        .unwrap();

    let policy = platform.scaling_policy(&web()).unwrap();
    assert_eq!(policy.max_capacity, 8);
}

#[tokio::test(start_paused = true)]
async fn cyclic_containers_are_rejected_at_submit() {
    let (_platform, manager) = seeded();
    let spec = TaskSpec::new("app")
        .with_container(
            ContainerSpec::new("app", "app:v2")
                .depends_on("proxy", DependencyCondition::Start),
        )
        .with_container(
            ContainerSpec::new("proxy", "envoy:1")
                .non_essential()
                .depends_on("app", DependencyCondition::Start),
        );

    let err = manager
        .submit(DeploymentRequest::new(web(), Strategy::Normal).with_task(spec))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, DeploymentError::InvalidSpec(_)));
    assert!(!manager.is_deploying(&web()));
}
