//! Cluster topology: one coordinator, N workers, a shared network and volume.
//!
//! [`TopologyBuilder`] is a pure constructor. Every name it produces is derived
//! from `{project}-{run_id}` so two invocations with different run ids never
//! collide, and leftovers of a crashed run can be found by that prefix.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{CoreError, RunId};

/// Mount point of the project directory inside every replica.
pub const CONTAINER_WORKDIR: &str = "/srv/loadrun";

/// Mount point of the per-run shared volume inside every replica.
pub const SHARED_VOLUME_MOUNT: &str = "/srv/shared";

/// Label key carrying the run prefix on every created resource.
pub const RUN_LABEL: &str = "io.loadrun.run";

/// Supported container engines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerSystem {
    #[default]
    Docker,
    Podman,
}

impl ContainerSystem {
    /// Executable name of the engine CLI.
    pub fn program(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

impl fmt::Display for ContainerSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

impl FromStr for ContainerSystem {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            other => Err(CoreError::InvalidInput(format!(
                "unsupported container system '{}'",
                other
            ))),
        }
    }
}

/// Resource limits applied uniformly to every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    /// Open file descriptor limit (soft and hard).
    pub limit_nofile: u64,

    /// Allocate a pseudo-TTY for each replica.
    pub tty: bool,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            limit_nofile: 10001,
            tty: false,
        }
    }
}

/// Timeout/retry/interval triple governing convergence waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawHealthPolicy")]
pub struct HealthPolicy {
    timeout: Duration,
    retries: u32,
    interval: Duration,
}

impl HealthPolicy {
    /// Build a policy; timeout and interval must be positive.
    pub fn new(timeout: Duration, retries: u32, interval: Duration) -> Result<Self, CoreError> {
        if timeout.is_zero() {
            return Err(CoreError::InvalidHealthPolicy(
                "timeout must be positive".to_string(),
            ));
        }
        if interval.is_zero() {
            return Err(CoreError::InvalidHealthPolicy(
                "interval must be positive".to_string(),
            ));
        }
        Ok(Self {
            timeout,
            retries,
            interval,
        })
    }

    /// Convenience constructor taking whole seconds.
    pub fn from_secs(timeout: u64, retries: u32, interval: u64) -> Result<Self, CoreError> {
        Self::new(
            Duration::from_secs(timeout),
            retries,
            Duration::from_secs(interval),
        )
    }

    /// Upper bound on the whole wait.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Additional polls after the first one.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Delay between two polls of the same replica.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Unchecked wire form; deserialization goes through [`HealthPolicy::new`].
#[derive(Deserialize)]
struct RawHealthPolicy {
    timeout: Duration,
    retries: u32,
    interval: Duration,
}

impl TryFrom<RawHealthPolicy> for HealthPolicy {
    type Error = CoreError;

    fn try_from(raw: RawHealthPolicy) -> Result<Self, Self::Error> {
        Self::new(raw.timeout, raw.retries, raw.interval)
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retries: 30,
            interval: Duration::from_secs(2),
        }
    }
}

/// Role of a replica in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Coordinator,
    Worker,
}

impl RoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One role of the topology and everything its replicas are started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    /// Coordinator or worker.
    pub kind: RoleKind,

    /// Image reference all replicas of this role run.
    pub image: String,

    /// Environment variables for every replica.
    pub env: BTreeMap<String, String>,

    /// Arguments passed to the image entrypoint.
    pub command: Vec<String>,

    /// Number of replicas (1 for the coordinator).
    pub replicas: usize,
}

/// Run-level settings handed to the replicas as explicit environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Feature file, relative to the project directory.
    pub run_file: String,

    /// Environment file, relative to the project directory.
    pub environment_file: Option<String>,

    /// `-T NAME=VALUE` pairs, exported as `TESTDATA_VARIABLE_NAME`.
    pub testdata: BTreeMap<String, String>,

    /// Ask the test runner for verbose output.
    pub verbose: bool,
}

impl RunSettings {
    pub fn new(run_file: impl Into<String>) -> Self {
        Self {
            run_file: run_file.into(),
            ..Default::default()
        }
    }

    /// Environment shared by every role.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("LOADRUN_RUN_FILE".to_string(), self.run_file.clone());
        if let Some(file) = &self.environment_file {
            env.insert("LOADRUN_ENVIRONMENT_FILE".to_string(), file.clone());
        }
        for (name, value) in &self.testdata {
            env.insert(format!("TESTDATA_VARIABLE_{}", name), value.clone());
        }
        env
    }

    /// Arguments for the test runner.
    pub fn runner_args(&self) -> Vec<String> {
        let mut args = vec![self.run_file.clone()];
        if self.verbose {
            args.extend(
                ["--verbose", "--no-logcapture", "--no-capture", "--no-capture-stderr"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
        args
    }
}

/// Normalize a registry address so it ends with exactly one `/`.
///
/// Returns `None` for an empty address. Normalizing twice is a no-op.
pub fn normalize_registry(registry: &str) -> Option<String> {
    let trimmed = registry.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    Some(format!("{}/", trimmed))
}

/// Immutable description of the cluster for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    run_id: RunId,
    project: String,
    prefix: String,
    image_tag: String,
    worker_count: usize,
    resources: ResourcePolicy,
    container_system: ContainerSystem,
    registry: Option<String>,
    context: PathBuf,
    network: String,
    volumes: Vec<String>,
    roles: Vec<Role>,
}

impl ClusterSpec {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Sanitized project name.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// `{project}-{run_id}`, the namespace of every created resource.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn image_tag(&self) -> &str {
        &self.image_tag
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn resources(&self) -> &ResourcePolicy {
        &self.resources
    }

    pub fn container_system(&self) -> ContainerSystem {
        self.container_system
    }

    /// Registry prefix, always ending with `/` when present.
    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    /// Project directory: build context and bind mount source.
    pub fn context(&self) -> &PathBuf {
        &self.context
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn volumes(&self) -> &[String] {
        &self.volumes
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Label (key, value) attached to every created resource.
    pub fn label(&self) -> (&'static str, &str) {
        (RUN_LABEL, &self.prefix)
    }

    /// Get the role of the given kind.
    pub fn role(&self, kind: RoleKind) -> &Role {
        // Both roles are always present; see TopologyBuilder::build.
        match kind {
            RoleKind::Coordinator => &self.roles[0],
            RoleKind::Worker => &self.roles[1],
        }
    }

    /// Image name without registry prefix.
    pub fn local_image(&self) -> String {
        format!("{}:{}", self.project, self.image_tag)
    }

    /// Image reference including the registry prefix, if any.
    pub fn image_reference(&self) -> String {
        format!(
            "{}{}",
            self.registry.as_deref().unwrap_or_default(),
            self.local_image()
        )
    }

    pub fn coordinator_name(&self) -> String {
        format!("{}-coordinator", self.prefix)
    }

    /// Name of worker `index` (1-based).
    pub fn worker_name(&self, index: usize) -> String {
        format!("{}-worker-{}", self.prefix, index)
    }

    /// Every replica in launch order: coordinator first, then workers.
    pub fn replicas(&self) -> Vec<(RoleKind, usize, String)> {
        let mut replicas = Vec::with_capacity(self.worker_count + 1);
        replicas.push((RoleKind::Coordinator, 1, self.coordinator_name()));
        for index in 1..=self.worker_count {
            replicas.push((RoleKind::Worker, index, self.worker_name(index)));
        }
        replicas
    }

    /// Return a copy with every role pointed at the given images.
    pub fn with_images(&self, images: &BTreeMap<RoleKind, String>) -> Self {
        let mut spec = self.clone();
        for role in &mut spec.roles {
            if let Some(image) = images.get(&role.kind) {
                role.image = image.clone();
            }
        }
        spec
    }
}

/// Builds a [`ClusterSpec`] from resolved options.
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    project: String,
    run_id: RunId,
    worker_count: i64,
    resources: ResourcePolicy,
    container_system: ContainerSystem,
    registry: Option<String>,
    image_tag: String,
    context: PathBuf,
    settings: RunSettings,
}

impl TopologyBuilder {
    /// Start a topology for `project` namespaced by `run_id`.
    pub fn new(project: impl Into<String>, run_id: RunId) -> Self {
        Self {
            project: project.into(),
            run_id,
            worker_count: 1,
            resources: ResourcePolicy::default(),
            container_system: ContainerSystem::default(),
            registry: None,
            image_tag: "latest".to_string(),
            context: PathBuf::from("."),
            settings: RunSettings::default(),
        }
    }

    /// Desired number of workers; negative values are rejected by `build`.
    pub fn worker_count(mut self, count: i64) -> Self {
        self.worker_count = count;
        self
    }

    pub fn resources(mut self, resources: ResourcePolicy) -> Self {
        self.resources = resources;
        self
    }

    pub fn container_system(mut self, system: ContainerSystem) -> Self {
        self.container_system = system;
        self
    }

    /// Registry address; normalized to a single trailing `/`.
    pub fn registry(mut self, registry: Option<&str>) -> Self {
        self.registry = registry.and_then(normalize_registry);
        self
    }

    pub fn image_tag(mut self, tag: impl Into<String>) -> Self {
        self.image_tag = tag.into();
        self
    }

    pub fn context(mut self, context: impl Into<PathBuf>) -> Self {
        self.context = context.into();
        self
    }

    pub fn settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Produce the immutable spec.
    pub fn build(self) -> Result<ClusterSpec, CoreError> {
        if self.worker_count < 0 {
            return Err(CoreError::InvalidTopology(format!(
                "worker count must be >= 0, got {}",
                self.worker_count
            )));
        }
        let worker_count = usize::try_from(self.worker_count).map_err(|_| {
            CoreError::InvalidTopology(format!("worker count {} too large", self.worker_count))
        })?;

        let project = sanitize_name(&self.project);
        if project.is_empty() {
            return Err(CoreError::InvalidTopology(format!(
                "project name '{}' has no usable characters",
                self.project
            )));
        }

        let image_tag = sanitize_name(&self.image_tag);
        if image_tag.is_empty() {
            return Err(CoreError::InvalidTopology(format!(
                "image tag '{}' has no usable characters",
                self.image_tag
            )));
        }

        let prefix = format!("{}-{}", project, self.run_id);
        let image = format!(
            "{}{}:{}",
            self.registry.as_deref().unwrap_or_default(),
            project,
            image_tag
        );
        let coordinator_host = format!("{}-coordinator", prefix);

        let mut common = self.settings.environment();
        common.insert("LOADRUN_RUN_ID".to_string(), self.run_id.to_string());

        let mut coordinator_env = common.clone();
        coordinator_env.insert(
            "LOADRUN_ROLE".to_string(),
            RoleKind::Coordinator.to_string(),
        );
        coordinator_env.insert(
            "LOADRUN_EXPECTED_WORKERS".to_string(),
            worker_count.to_string(),
        );

        let mut worker_env = common;
        worker_env.insert("LOADRUN_ROLE".to_string(), RoleKind::Worker.to_string());
        worker_env.insert("LOADRUN_COORDINATOR_HOST".to_string(), coordinator_host);

        let command = self.settings.runner_args();

        let roles = vec![
            Role {
                kind: RoleKind::Coordinator,
                image: image.clone(),
                env: coordinator_env,
                command: command.clone(),
                replicas: 1,
            },
            Role {
                kind: RoleKind::Worker,
                image,
                env: worker_env,
                command,
                replicas: worker_count,
            },
        ];

        Ok(ClusterSpec {
            network: format!("{}-net", prefix),
            volumes: vec![format!("{}-shared", prefix)],
            run_id: self.run_id,
            project,
            prefix,
            image_tag,
            worker_count,
            resources: self.resources,
            container_system: self.container_system,
            registry: self.registry,
            context: self.context,
            roles,
        })
    }
}

/// Lowercase and replace anything outside `[a-z0-9_.-]` with `-`.
fn sanitize_name(name: &str) -> String {
    let mapped: String = name
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped
        .trim_matches(|c| c == '-' || c == '.' || c == '_')
        .to_string()
}
