//! Task specifications
//!
//! A TaskSpec describes one task-definition revision: the containers that run
//! together, their startup dependencies and the task-level resource envelope.
//! Specs submitted with a request may be partial; the resolver fills the gaps
//! before [`TaskSpec::validate`] is applied.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// Default task CPU units when neither the request nor the service sets one
pub const DEFAULT_TASK_CPU: u32 = 256;

/// Default task memory (MiB) when neither the request nor the service sets one
pub const DEFAULT_TASK_MEMORY: u32 = 512;

/// Default container port for the primary container
pub const DEFAULT_CONTAINER_PORT: u16 = 80;

/// Condition a dependency must reach before the dependent container starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyCondition {
    /// Dependency has been started
    Start,
    /// Dependency passed its health check
    Healthy,
    /// Dependency ran to completion (any exit code)
    Complete,
    /// Dependency exited with code 0
    Success,
}

impl DependencyCondition {
    /// Conditions that require the dependency to exit
    pub fn requires_exit(&self) -> bool {
        matches!(self, DependencyCondition::Complete | DependencyCondition::Success)
    }
}

/// Startup dependency on another container of the same task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDependency {
    pub container_name: String,
    pub condition: DependencyCondition,
}

impl ContainerDependency {
    pub fn new(container_name: impl Into<String>, condition: DependencyCondition) -> Self {
        Self {
            container_name: container_name.into(),
            condition,
        }
    }
}

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    #[serde(default)]
    pub host_port: Option<u16>,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortMapping {
    pub fn tcp(container_port: u16) -> Self {
        Self {
            container_port,
            host_port: None,
            protocol: Protocol::Tcp,
        }
    }
}

/// Container health check, run by the platform inside the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub command: Vec<String>,
    #[serde(with = "crate::duration_serde")]
    pub interval: Duration,
    #[serde(with = "crate::duration_serde")]
    pub timeout: Duration,
    pub retries: u32,
    #[serde(with = "crate::duration_serde")]
    pub start_period: Duration,
}

impl HealthCheck {
    /// HTTP probe against `/health` on the given port
    pub fn http(port: u16) -> Self {
        Self {
            command: vec![
                "CMD-SHELL".to_string(),
                format!("curl -f http://localhost:{}/health || exit 1", port),
            ],
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            retries: 3,
            start_period: Duration::from_secs(60),
        }
    }
}

/// Per-container resource reservation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReservation {
    /// CPU units reserved for the container
    #[serde(default)]
    pub cpu: Option<u32>,
    /// Hard memory limit (MiB)
    #[serde(default)]
    pub memory: Option<u32>,
    /// Soft memory reservation (MiB)
    #[serde(default)]
    pub memory_reservation: Option<u32>,
}

/// One container of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,

    /// Image reference; `None` means "inherit from the running revision"
    #[serde(default)]
    pub image: Option<String>,

    #[serde(default = "default_true")]
    pub essential: bool,

    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,

    #[serde(default)]
    pub health_check: Option<HealthCheck>,

    #[serde(default)]
    pub resources: ResourceReservation,

    #[serde(default)]
    pub depends_on: Vec<ContainerDependency>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl ContainerSpec {
    /// Create an essential container running `image`
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: Some(image.into()),
            essential: true,
            port_mappings: Vec::new(),
            health_check: None,
            resources: ResourceReservation::default(),
            depends_on: Vec::new(),
            environment: BTreeMap::new(),
        }
    }

    /// Create a container whose image is inherited from the current revision
    pub fn inherit(name: impl Into<String>) -> Self {
        Self {
            image: None,
            ..Self::new(name, String::new())
        }
    }

    pub fn non_essential(mut self) -> Self {
        self.essential = false;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port_mappings.push(PortMapping::tcp(port));
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheck) -> Self {
        self.health_check = Some(health_check);
        self
    }

    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.resources.cpu = Some(cpu);
        self
    }

    pub fn with_memory(mut self, memory: u32) -> Self {
        self.resources.memory = Some(memory);
        self
    }

    pub fn depends_on(
        mut self,
        container_name: impl Into<String>,
        condition: DependencyCondition,
    ) -> Self {
        self.depends_on
            .push(ContainerDependency::new(container_name, condition));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

/// Immutable description of a task-definition revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task-definition family; empty means "inherit"
    #[serde(default)]
    pub family: String,

    #[serde(default)]
    pub containers: Vec<ContainerSpec>,

    /// Task CPU units
    #[serde(default)]
    pub cpu: Option<u32>,

    /// Task memory (MiB)
    #[serde(default)]
    pub memory: Option<u32>,

    #[serde(default)]
    pub execution_role: Option<String>,

    #[serde(default)]
    pub task_role: Option<String>,

    /// Allow interactive exec sessions into running tasks
    #[serde(default)]
    pub enable_execute_command: bool,
}

impl TaskSpec {
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            containers: Vec::new(),
            cpu: None,
            memory: None,
            execution_role: None,
            task_role: None,
            enable_execute_command: false,
        }
    }

    /// An empty spec: every field inherits from the running revision
    pub fn inherit() -> Self {
        Self::new("")
    }

    pub fn with_container(mut self, container: ContainerSpec) -> Self {
        self.containers.push(container);
        self
    }

    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn with_memory(mut self, memory: u32) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// The named container, or the first essential one
    pub fn primary_container_mut(&mut self, name: Option<&str>) -> Option<&mut ContainerSpec> {
        match name {
            Some(name) => self.containers.iter_mut().find(|c| c.name == name),
            None => self.containers.iter_mut().find(|c| c.essential),
        }
    }

    /// Check every structural invariant of a fully-resolved spec
    pub fn validate(&self) -> Result<(), TaskSpecError> {
        if self.family.is_empty() {
            return Err(TaskSpecError::EmptyFamily);
        }
        if self.containers.is_empty() {
            return Err(TaskSpecError::NoContainers);
        }

        let mut seen = HashSet::new();
        for container in &self.containers {
            if !seen.insert(container.name.as_str()) {
                return Err(TaskSpecError::DuplicateContainer(container.name.clone()));
            }
            match container.image.as_deref() {
                Some(image) if !image.is_empty() => {}
                _ => return Err(TaskSpecError::MissingImage(container.name.clone())),
            }
        }

        if !self.containers.iter().any(|c| c.essential) {
            return Err(TaskSpecError::NoEssentialContainer);
        }

        for container in &self.containers {
            for dep in &container.depends_on {
                let target = self.container(&dep.container_name).ok_or_else(|| {
                    TaskSpecError::UnknownDependency {
                        container: container.name.clone(),
                        dependency: dep.container_name.clone(),
                    }
                })?;
                if dep.condition.requires_exit() && target.essential {
                    return Err(TaskSpecError::ExitConditionOnEssential {
                        container: container.name.clone(),
                        dependency: dep.container_name.clone(),
                    });
                }
            }
        }

        self.startup_order()?;
        self.check_resources()
    }

    /// Container names in a dependency-respecting startup order.
    ///
    /// Unconstrained containers keep their declaration order.
    pub fn startup_order(&self) -> Result<Vec<&str>, TaskSpecError> {
        let index: HashMap<&str, usize> = self
            .containers
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.as_str(), i))
            .collect();

        let mut marks = vec![Mark::Unvisited; self.containers.len()];
        let mut path = Vec::new();
        let mut order = Vec::with_capacity(self.containers.len());

        for idx in 0..self.containers.len() {
            visit(self, idx, &index, &mut marks, &mut path, &mut order)?;
        }

        Ok(order)
    }

    /// The same spec with its containers listed in [`Self::startup_order`]
    pub fn into_startup_order(mut self) -> Result<TaskSpec, TaskSpecError> {
        let order: HashMap<String, usize> = self
            .startup_order()?
            .into_iter()
            .enumerate()
            .map(|(position, name)| (name.to_string(), position))
            .collect();
        self.containers
            .sort_by_key(|c| order.get(&c.name).copied().unwrap_or(usize::MAX));
        Ok(self)
    }

    /// Stable content fingerprint; identical specs hash identically
    pub fn fingerprint(&self) -> Result<String, TaskSpecError> {
        let mut hasher = blake3::Hasher::new();
        serde_json::to_writer(&mut hasher, self)
            .map_err(|e| TaskSpecError::Encoding(e.to_string()))?;
        Ok(hasher.finalize().to_hex().to_string())
    }

    fn check_resources(&self) -> Result<(), TaskSpecError> {
        if let Some(task_cpu) = self.cpu {
            let sum: u32 = self.containers.iter().filter_map(|c| c.resources.cpu).sum();
            if sum > task_cpu {
                return Err(TaskSpecError::ResourceOverCommit {
                    resource: "cpu",
                    task: task_cpu,
                    containers: sum,
                });
            }
        }
        if let Some(task_memory) = self.memory {
            let sum: u32 = self
                .containers
                .iter()
                .filter_map(|c| c.resources.memory)
                .sum();
            if sum > task_memory {
                return Err(TaskSpecError::ResourceOverCommit {
                    resource: "memory",
                    task: task_memory,
                    containers: sum,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

fn visit<'a>(
    spec: &'a TaskSpec,
    idx: usize,
    index: &HashMap<&'a str, usize>,
    marks: &mut [Mark],
    path: &mut Vec<usize>,
    order: &mut Vec<&'a str>,
) -> Result<(), TaskSpecError> {
    match marks[idx] {
        Mark::Done => return Ok(()),
        Mark::InProgress => {
            let start = path.iter().position(|&i| i == idx).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..]
                .iter()
                .map(|&i| spec.containers[i].name.clone())
                .collect();
            cycle.push(spec.containers[idx].name.clone());
            return Err(TaskSpecError::DependencyCycle { cycle });
        }
        Mark::Unvisited => {}
    }

    marks[idx] = Mark::InProgress;
    path.push(idx);

    let container = &spec.containers[idx];
    for dep in &container.depends_on {
        let dep_idx = *index.get(dep.container_name.as_str()).ok_or_else(|| {
            TaskSpecError::UnknownDependency {
                container: container.name.clone(),
                dependency: dep.container_name.clone(),
            }
        })?;
        visit(spec, dep_idx, index, marks, path, order)?;
    }

    path.pop();
    marks[idx] = Mark::Done;
    order.push(container.name.as_str());
    Ok(())
}

/// Task spec validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskSpecError {
    #[error("task definition family is empty")]
    EmptyFamily,

    #[error("task has no containers")]
    NoContainers,

    #[error("container name '{0}' is used more than once")]
    DuplicateContainer(String),

    #[error("container '{0}' has no image")]
    MissingImage(String),

    #[error("task has no essential container")]
    NoEssentialContainer,

    #[error("container '{container}' depends on unknown container '{dependency}'")]
    UnknownDependency {
        container: String,
        dependency: String,
    },

    #[error("container '{container}' waits for essential container '{dependency}' to exit")]
    ExitConditionOnEssential {
        container: String,
        dependency: String,
    },

    #[error("container dependency cycle: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("task {resource} {task} is below the sum of container limits {containers}")]
    ResourceOverCommit {
        resource: &'static str,
        task: u32,
        containers: u32,
    },

    #[error("failed to encode task spec: {0}")]
    Encoding(String),
}
