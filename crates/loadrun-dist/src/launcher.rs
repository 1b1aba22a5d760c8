//! Cluster launcher - creates the network, the shared volume and every
//! replica, coordinator first.

use std::collections::BTreeMap;
use std::sync::Arc;

use loadrun_backend::{BackendError, ContainerBackend, ContainerId, ContainerSpec, HealthCheck, Mount};
use loadrun_core::topology::{CONTAINER_WORKDIR, SHARED_VOLUME_MOUNT};
use loadrun_core::{ClusterSpec, HealthPolicy, RoleKind};
use tracing::{error, info};

use crate::error::DistError;
use crate::teardown::TeardownController;

/// Label key carrying the role of a replica.
pub const ROLE_LABEL: &str = "io.loadrun.role";

/// A started replica.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaHandle {
    pub name: String,
    pub role: RoleKind,
    /// 1-based index within the role.
    pub index: usize,
    pub container: ContainerId,
}

/// Live cluster: the spec it was launched from and its replicas.
#[derive(Debug, Clone)]
pub struct RunHandle {
    spec: Arc<ClusterSpec>,
    replicas: Vec<ReplicaHandle>,
}

impl RunHandle {
    pub fn new(spec: Arc<ClusterSpec>, replicas: Vec<ReplicaHandle>) -> Self {
        Self { spec, replicas }
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    /// Replicas in launch order, coordinator first.
    pub fn replicas(&self) -> &[ReplicaHandle] {
        &self.replicas
    }

    pub fn coordinator(&self) -> Option<&ReplicaHandle> {
        self.replicas.iter().find(|r| r.role == RoleKind::Coordinator)
    }

    pub fn workers(&self) -> impl Iterator<Item = &ReplicaHandle> {
        self.replicas.iter().filter(|r| r.role == RoleKind::Worker)
    }
}

/// Resource labels shared by everything a run creates.
pub fn run_labels(spec: &ClusterSpec) -> BTreeMap<String, String> {
    let (key, value) = spec.label();
    let mut labels = BTreeMap::new();
    labels.insert(key.to_string(), value.to_string());
    labels
}

/// Describe how replica `name` of `kind` is started.
pub fn container_spec(
    spec: &ClusterSpec,
    kind: RoleKind,
    name: &str,
    health: &HealthPolicy,
) -> ContainerSpec {
    let role = spec.role(kind);
    let mut container = ContainerSpec::new(name, role.image.clone());

    container.network = spec.network().to_string();
    container.env = role.env.clone();
    container.command = role.command.clone();
    container.labels = run_labels(spec);
    container
        .labels
        .insert(ROLE_LABEL.to_string(), kind.to_string());

    container.mounts.push(Mount::bind(
        spec.context().display().to_string(),
        CONTAINER_WORKDIR,
    ));
    for volume in spec.volumes() {
        container
            .mounts
            .push(Mount::volume(volume.clone(), SHARED_VOLUME_MOUNT));
    }
    container.workdir = Some(CONTAINER_WORKDIR.to_string());

    container.limit_nofile = spec.resources().limit_nofile;
    container.tty = spec.resources().tty;
    container.health = Some(HealthCheck {
        interval: health.interval(),
        timeout: health.interval(),
        retries: health.retries(),
    });

    container
}

/// Starts a cluster from a [`ClusterSpec`].
pub struct ClusterLauncher {
    backend: Arc<dyn ContainerBackend>,
}

impl ClusterLauncher {
    pub fn new(backend: Arc<dyn ContainerBackend>) -> Self {
        Self { backend }
    }

    /// Launch the cluster.
    ///
    /// On failure everything created so far is removed through `teardown`
    /// before the error is returned.
    pub async fn launch(
        &self,
        spec: Arc<ClusterSpec>,
        health: &HealthPolicy,
        teardown: &TeardownController,
    ) -> Result<RunHandle, DistError> {
        match self.start_all(&spec, health).await {
            Ok(replicas) => {
                info!(
                    prefix = %spec.prefix(),
                    replicas = replicas.len(),
                    "Cluster launched"
                );
                Ok(RunHandle::new(spec, replicas))
            }
            Err((resource, source)) => {
                error!(%resource, error = %source, "Launch failed");
                teardown.teardown().await;
                Err(DistError::Launch { resource, source })
            }
        }
    }

    async fn start_all(
        &self,
        spec: &ClusterSpec,
        health: &HealthPolicy,
    ) -> Result<Vec<ReplicaHandle>, (String, BackendError)> {
        let labels = run_labels(spec);

        self.backend
            .create_network(spec.network(), &labels)
            .await
            .map_err(|e| (format!("network {}", spec.network()), e))?;

        for volume in spec.volumes() {
            self.backend
                .create_volume(volume, &labels)
                .await
                .map_err(|e| (format!("volume {}", volume), e))?;
        }

        let mut replicas = Vec::with_capacity(spec.worker_count() + 1);
        for (role, index, name) in spec.replicas() {
            let container = container_spec(spec, role, &name, health);
            let id = self
                .backend
                .start_container(&container)
                .await
                .map_err(|e| (format!("{} {}", role, name), e))?;

            info!(replica = %name, %role, container = %id, "Replica started");
            replicas.push(ReplicaHandle {
                name,
                role,
                index,
                container: id,
            });
        }

        Ok(replicas)
    }
}
