//! Resolved options for one distributed invocation.

use std::path::PathBuf;
use std::time::Duration;

use loadrun_core::{
    ClusterSpec, ContainerSystem, CoreError, HealthPolicy, ResourcePolicy, RunId, RunSettings,
    TopologyBuilder,
};

/// Default bound on one run: a day.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Image build behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Disable layer caching.
    pub no_cache: bool,

    /// Build even if the image already exists.
    pub force_build: bool,
}

/// Validated options for a distributed run.
#[derive(Debug, Clone)]
pub struct DistOptions {
    /// Project name; base of image and resource names.
    pub project: String,

    /// Project directory (absolute): build context and bind mount.
    pub context: PathBuf,

    /// Explicit run id; generated when absent.
    pub run_id: Option<String>,

    /// Image tag, usually the invoking user.
    pub image_tag: String,

    /// Requested worker replicas.
    pub workers: i64,

    /// Engine to drive.
    pub container_system: ContainerSystem,

    /// Registry prefix for images.
    pub registry: Option<String>,

    /// Limits applied to every replica.
    pub resources: ResourcePolicy,

    /// Convergence policy.
    pub health: HealthPolicy,

    /// Image build behaviour.
    pub build: BuildOptions,

    /// Run-level settings handed to the replicas.
    pub settings: RunSettings,

    /// How long workers may keep running after the coordinator exits.
    pub worker_grace: Duration,

    /// Upper bound on waiting for the coordinator to exit.
    pub run_timeout: Duration,
}

impl Default for DistOptions {
    fn default() -> Self {
        Self {
            project: "loadrun".to_string(),
            context: PathBuf::from("."),
            run_id: None,
            image_tag: "latest".to_string(),
            workers: 1,
            container_system: ContainerSystem::default(),
            registry: None,
            resources: ResourcePolicy::default(),
            health: HealthPolicy::default(),
            build: BuildOptions::default(),
            settings: RunSettings::default(),
            worker_grace: Duration::from_secs(10),
            run_timeout: DEFAULT_RUN_TIMEOUT,
        }
    }
}

impl DistOptions {
    /// Build the cluster topology these options describe.
    pub fn topology(&self) -> Result<ClusterSpec, CoreError> {
        let run_id = match &self.run_id {
            Some(id) => RunId::parse(id)?,
            None => RunId::generate(),
        };

        TopologyBuilder::new(self.project.clone(), run_id)
            .worker_count(self.workers)
            .resources(self.resources)
            .container_system(self.container_system)
            .registry(self.registry.as_deref())
            .image_tag(self.image_tag.clone())
            .context(self.context.clone())
            .settings(self.settings.clone())
            .build()
    }
}
