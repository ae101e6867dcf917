//! Desired-State Resolver
//!
//! Merges a (possibly partial) deployment request with what the service runs
//! today and produces the complete target state. Pure: no platform calls.

use crate::error::{DeploymentError, Result};
use convoy_types::{
    ContainerSpec, DeploymentRequest, ScalingPolicy, ServiceKey, ServiceRecord, Strategy,
    TaskDefaults, TaskDefinitionRevision, TaskSpec, DEFAULT_CONTAINER_PORT,
};
use serde::{Deserialize, Serialize};

/// Fully resolved desired state of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub key: ServiceKey,
    /// Complete, validated spec to register, containers in startup order
    pub task_spec: TaskSpec,
    pub desired_count: u32,
    pub current_revision: Option<TaskDefinitionRevision>,
    pub previous_revision: Option<TaskDefinitionRevision>,
    /// Revision a rollback moves to
    pub rollback_to: Option<TaskDefinitionRevision>,
    /// Whether the task-level definition differs from the running one
    pub definition_changed: bool,
    pub service_exists: bool,
    pub scaling_policy: Option<ScalingPolicy>,
}

/// Resolves requests against the current service record
#[derive(Debug, Clone, Default)]
pub struct DesiredStateResolver {
    defaults: TaskDefaults,
}

impl DesiredStateResolver {
    pub fn new(defaults: TaskDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &TaskDefaults {
        &self.defaults
    }

    pub fn resolve(&self, current: &ServiceRecord, request: &DeploymentRequest) -> Result<TargetState> {
        let base = current.task_spec.as_ref();

        let scaling_policy = match &request.scaling_policy {
            Some(policy) => {
                policy.validate()?;
                Some(policy.clone())
            }
            None => None,
        };

        let desired_count = request.desired_count.unwrap_or(
            if current.exists && current.current_revision.is_some() {
                current.desired_count
            } else {
                self.defaults.desired_count
            },
        );

        if let Strategy::Rollback { target_revision } = &request.strategy {
            let rollback_to = target_revision
                .clone()
                .or_else(|| current.previous_revision.clone())
                .ok_or_else(|| {
                    DeploymentError::MissingRequiredField(format!(
                        "target_revision (no previous revision recorded for {})",
                        request.key
                    ))
                })?;
            let task_spec = base
                .cloned()
                .unwrap_or_else(|| TaskSpec::new(rollback_to.family()));

            return Ok(TargetState {
                key: request.key.clone(),
                task_spec,
                desired_count,
                current_revision: current.current_revision.clone(),
                previous_revision: current.previous_revision.clone(),
                definition_changed: current.current_revision.as_ref() != Some(&rollback_to),
                rollback_to: Some(rollback_to),
                service_exists: current.exists,
                scaling_policy,
            });
        }

        let mut spec = self.merge(&request.key, base, &request.task)?;

        match &request.strategy {
            Strategy::Hotfix { image, container } => {
                let target = primary_container(&mut spec, container.as_deref())?;
                target.image = Some(image.clone());
            }
            Strategy::ConfigChange {
                environment,
                container,
            } => {
                let target = primary_container(&mut spec, container.as_deref())?;
                target
                    .environment
                    .extend(environment.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            _ => {}
        }

        for container in &spec.containers {
            match container.image.as_deref() {
                Some(image) if !image.is_empty() => {}
                _ => {
                    return Err(DeploymentError::MissingRequiredField(format!(
                        "image for container '{}'",
                        container.name
                    )))
                }
            }
        }

        if base.is_none() && !matches!(request.strategy, Strategy::ScheduledBatch { .. }) {
            if let Some(primary) = spec.primary_container_mut(None) {
                if primary.port_mappings.is_empty() {
                    primary.port_mappings.push(convoy_types::PortMapping::tcp(DEFAULT_CONTAINER_PORT));
                }
            }
        }

        spec.validate()?;
        let spec = spec.into_startup_order()?;

        Ok(TargetState {
            key: request.key.clone(),
            definition_changed: base != Some(&spec),
            task_spec: spec,
            desired_count,
            current_revision: current.current_revision.clone(),
            previous_revision: current.previous_revision.clone(),
            rollback_to: None,
            service_exists: current.exists,
            scaling_policy,
        })
    }

    /// Field-by-field inheritance from the running spec
    fn merge(&self, key: &ServiceKey, base: Option<&TaskSpec>, requested: &TaskSpec) -> Result<TaskSpec> {
        let family = if !requested.family.is_empty() {
            requested.family.clone()
        } else if let Some(base) = base {
            base.family.clone()
        } else {
            key.service.as_str().to_string()
        };

        let containers: Vec<ContainerSpec> = if requested.containers.is_empty() {
            base.map(|b| b.containers.clone()).unwrap_or_default()
        } else {
            requested
                .containers
                .iter()
                .map(|c| {
                    let mut container = c.clone();
                    if container.image.is_none() {
                        container.image = base
                            .and_then(|b| b.container(&c.name))
                            .and_then(|b| b.image.clone());
                    }
                    container
                })
                .collect()
        };

        if containers.is_empty() {
            return Err(DeploymentError::MissingRequiredField(format!(
                "containers for {} (nothing to inherit)",
                key
            )));
        }

        Ok(TaskSpec {
            family,
            containers,
            cpu: requested
                .cpu
                .or_else(|| base.and_then(|b| b.cpu))
                .or(Some(self.defaults.cpu)),
            memory: requested
                .memory
                .or_else(|| base.and_then(|b| b.memory))
                .or(Some(self.defaults.memory)),
            execution_role: requested
                .execution_role
                .clone()
                .or_else(|| base.and_then(|b| b.execution_role.clone())),
            task_role: requested
                .task_role
                .clone()
                .or_else(|| base.and_then(|b| b.task_role.clone())),
            enable_execute_command: requested.enable_execute_command
                || base.map(|b| b.enable_execute_command).unwrap_or(false),
        })
    }
}

fn primary_container<'a>(spec: &'a mut TaskSpec, name: Option<&str>) -> Result<&'a mut ContainerSpec> {
    let family = spec.family.clone();
    spec.primary_container_mut(name).ok_or_else(|| match name {
        Some(name) => DeploymentError::InvalidSpec(format!(
            "task '{}' has no container named '{}'",
            family, name
        )),
        None => DeploymentError::InvalidSpec(format!("task '{}' has no essential container", family)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_types::DependencyCondition;
    use std::collections::BTreeMap;

    fn running_record() -> ServiceRecord {
        let spec = TaskSpec::new("app")
            .with_cpu(512)
            .with_memory(1024)
            .with_container(
                ContainerSpec::new("app", "registry/app:v1")
                    .with_port(8080)
                    .with_env("LOG_LEVEL", "info"),
            )
            .with_container(ContainerSpec::new("envoy", "envoy:1.29").non_essential());
        ServiceRecord {
            current_revision: Some(TaskDefinitionRevision::new("app", 8)),
            previous_revision: Some(TaskDefinitionRevision::new("app", 7)),
            task_spec: Some(spec),
            desired_count: 3,
            running_count: 3,
            deployment_count: 1,
            exists: true,
            ..ServiceRecord::absent(ServiceKey::new("prod", "web"))
        }
    }

    fn request(strategy: Strategy) -> DeploymentRequest {
        DeploymentRequest::new(ServiceKey::new("prod", "web"), strategy)
    }

    #[test]
    fn test_inherits_everything_omitted() {
        let resolver = DesiredStateResolver::default();
        let req = request(Strategy::Normal).with_task(
            TaskSpec::inherit()
                .with_container(ContainerSpec::new("app", "registry/app:v2").with_port(8080))
                .with_container(ContainerSpec::inherit("envoy").non_essential()),
        );

        let target = resolver.resolve(&running_record(), &req).unwrap();
        assert_eq!(target.task_spec.family, "app");
        assert_eq!(target.task_spec.cpu, Some(512));
        assert_eq!(target.task_spec.memory, Some(1024));
        assert_eq!(
            target.task_spec.container("envoy").unwrap().image.as_deref(),
            Some("envoy:1.29")
        );
        assert_eq!(target.desired_count, 3);
        assert!(target.definition_changed);
        assert!(target.service_exists);
    }

    #[test]
    fn test_defaults_for_new_service() {
        let resolver = DesiredStateResolver::default();
        let record = ServiceRecord::absent(ServiceKey::new("prod", "web"));
        let req = request(Strategy::Normal)
            .with_task(TaskSpec::inherit().with_container(ContainerSpec::new("web", "nginx:1.27")));

        let target = resolver.resolve(&record, &req).unwrap();
        assert_eq!(target.task_spec.family, "web");
        assert_eq!(target.task_spec.cpu, Some(256));
        assert_eq!(target.task_spec.memory, Some(512));
        assert_eq!(target.desired_count, 2);
        assert_eq!(
            target.task_spec.containers[0].port_mappings[0].container_port,
            DEFAULT_CONTAINER_PORT
        );
        assert!(!target.service_exists);
    }

    #[test]
    fn test_missing_image() {
        let resolver = DesiredStateResolver::default();
        let record = ServiceRecord::absent(ServiceKey::new("prod", "web"));
        let req = request(Strategy::Normal)
            .with_task(TaskSpec::inherit().with_container(ContainerSpec::inherit("web")));

        assert!(matches!(
            resolver.resolve(&record, &req),
            Err(DeploymentError::MissingRequiredField(_))
        ));
    }

    #[test]
    fn test_cycle_is_invalid_spec() {
        let resolver = DesiredStateResolver::default();
        let req = request(Strategy::Normal).with_task(
            TaskSpec::new("app")
                .with_container(
                    ContainerSpec::new("a", "img").depends_on("b", DependencyCondition::Start),
                )
                .with_container(
                    ContainerSpec::new("b", "img")
                        .non_essential()
                        .depends_on("a", DependencyCondition::Start),
                ),
        );

        assert!(matches!(
            resolver.resolve(&running_record(), &req),
            Err(DeploymentError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_hotfix_overrides_primary_image() {
        let resolver = DesiredStateResolver::default();
        let req = request(Strategy::Hotfix {
            image: "registry/app:v1-hotfix".into(),
            container: None,
        });

        let target = resolver.resolve(&running_record(), &req).unwrap();
        assert_eq!(
            target.task_spec.container("app").unwrap().image.as_deref(),
            Some("registry/app:v1-hotfix")
        );
        assert_eq!(
            target.task_spec.container("envoy").unwrap().image.as_deref(),
            Some("envoy:1.29")
        );
    }

    #[test]
    fn test_config_change_merges_environment() {
        let resolver = DesiredStateResolver::default();
        let mut environment = BTreeMap::new();
        environment.insert("LOG_LEVEL".to_string(), "debug".to_string());
        environment.insert("FEATURE_X".to_string(), "on".to_string());
        let req = request(Strategy::ConfigChange {
            environment,
            container: Some("app".into()),
        });

        let target = resolver.resolve(&running_record(), &req).unwrap();
        let app = target.task_spec.container("app").unwrap();
        assert_eq!(app.environment.get("LOG_LEVEL").map(String::as_str), Some("debug"));
        assert_eq!(app.environment.get("FEATURE_X").map(String::as_str), Some("on"));
        assert!(target.definition_changed);
    }

    #[test]
    fn test_config_change_count_only_keeps_definition() {
        let resolver = DesiredStateResolver::default();
        let req = request(Strategy::ConfigChange {
            environment: BTreeMap::new(),
            container: None,
        })
        .with_desired_count(6);

        let target = resolver.resolve(&running_record(), &req).unwrap();
        assert!(!target.definition_changed);
        assert_eq!(target.desired_count, 6);
    }

    #[test]
    fn test_rollback_defaults_to_previous() {
        let resolver = DesiredStateResolver::default();
        let target = resolver
            .resolve(
                &running_record(),
                &request(Strategy::Rollback {
                    target_revision: None,
                }),
            )
            .unwrap();
        assert_eq!(target.rollback_to.unwrap().to_string(), "app:7");

        let mut record = running_record();
        record.previous_revision = None;
        assert!(matches!(
            resolver.resolve(
                &record,
                &request(Strategy::Rollback {
                    target_revision: None
                })
            ),
            Err(DeploymentError::MissingRequiredField(_))
        ));
    }

    #[test]
    fn test_unknown_hotfix_container() {
        let resolver = DesiredStateResolver::default();
        let req = request(Strategy::Hotfix {
            image: "x".into(),
            container: Some("ghost".into()),
        });
        assert!(matches!(
            resolver.resolve(&running_record(), &req),
            Err(DeploymentError::InvalidSpec(_))
        ));
    }
}
