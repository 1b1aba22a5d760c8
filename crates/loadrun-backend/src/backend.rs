//! Capability set every container backend provides.
//!
//! The orchestrator only ever talks to [`ContainerBackend`]; which engine sits
//! behind it is decided once, when the backend is constructed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use loadrun_core::{ClusterSpec, ContainerSystem, RoleStatus};
use tokio::sync::mpsc;

use crate::error::BackendError;

/// Engine-assigned container identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Engines print 64 hex chars; the first 12 identify a container.
        let short = self.0.get(..12).unwrap_or(&self.0);
        write!(f, "{}", short)
    }
}

/// Request to build one image.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    /// Build context directory.
    pub context: PathBuf,

    /// Containerfile/Dockerfile to build from.
    pub containerfile: PathBuf,

    /// Tags applied to the result.
    pub tags: Vec<String>,

    /// Disable layer caching.
    pub no_cache: bool,

    /// Labels applied to the image.
    pub labels: BTreeMap<String, String>,
}

/// Kind of mount attached to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Host path.
    Bind,
    /// Named volume.
    Volume,
}

/// A mount attached to a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub kind: MountKind,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Volume,
            source: name.into(),
            target: target.into(),
            read_only: false,
        }
    }
}

/// Cadence of the image-defined health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheck {
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

/// Everything needed to start one detached container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub env: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub workdir: Option<String>,
    pub limit_nofile: u64,
    pub tty: bool,
    pub health: Option<HealthCheck>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            network: String::new(),
            env: BTreeMap::new(),
            command: Vec::new(),
            labels: BTreeMap::new(),
            mounts: Vec::new(),
            workdir: None,
            limit_nofile: 0,
            tty: false,
            health: None,
        }
    }
}

/// Abstract capability set of a container engine.
///
/// Methods returning `i32` report the engine's exit code instead of failing,
/// so callers decide whether a non-zero code is fatal.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Which engine this backend drives.
    fn system(&self) -> ContainerSystem;

    /// Returns true if the image reference exists locally.
    async fn image_exists(&self, image: &str) -> Result<bool, BackendError>;

    /// Build an image; returns the build's exit code.
    async fn build_image(&self, request: &BuildRequest) -> Result<i32, BackendError>;

    /// Tag `source` as `target`; returns the exit code.
    async fn tag_image(&self, source: &str, target: &str) -> Result<i32, BackendError>;

    /// Push an image to its registry; returns the exit code.
    async fn push_image(&self, image: &str) -> Result<i32, BackendError>;

    /// Create a labelled network.
    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), BackendError>;

    /// Create a labelled volume.
    async fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), BackendError>;

    /// Start one detached container.
    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerId, BackendError>;

    /// Observe the current state of a container.
    async fn poll_health(&self, container: &ContainerId) -> Result<RoleStatus, BackendError>;

    /// Forward container output line by line until it ends or `sink` closes.
    async fn stream_logs(
        &self,
        container: &ContainerId,
        sink: mpsc::Sender<String>,
    ) -> Result<(), BackendError>;

    /// Wait for a container to exit and return its exit code.
    async fn await_exit(&self, container: &ContainerId) -> Result<i32, BackendError>;

    /// Remove every container, network and volume labelled for this cluster.
    async fn remove_resources(&self, spec: &ClusterSpec) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_display_is_short() {
        let id = ContainerId::new("0123456789abcdef0123456789abcdef");
        assert_eq!(id.to_string(), "0123456789ab");
        assert_eq!(id.as_str().len(), 32);

        let short = ContainerId::new("abc");
        assert_eq!(short.to_string(), "abc");
    }

    #[test]
    fn test_mount_constructors() {
        let bind = Mount::bind("/home/me/project", "/srv/loadrun");
        assert_eq!(bind.kind, MountKind::Bind);
        assert!(!bind.read_only);

        let volume = Mount::volume("p-run-shared", "/srv/shared");
        assert_eq!(volume.kind, MountKind::Volume);
        assert_eq!(volume.source, "p-run-shared");
    }
}
