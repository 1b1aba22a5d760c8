//! Scripted in-memory backend for orchestrator tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use loadrun_backend::{BackendError, BuildRequest, ContainerBackend, ContainerId, ContainerSpec};
use loadrun_core::{ClusterSpec, ContainerSystem, RoleStatus};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Scripted exit of one container: exit `code` after `after`.
#[derive(Debug, Clone, Copy)]
pub struct ScriptedExit {
    pub after: Duration,
    pub code: i32,
}

/// Backend whose behaviour is scripted per container name.
///
/// Container ids are the container names, which keeps assertions readable.
#[derive(Default)]
pub struct MockBackend {
    images: Mutex<HashSet<String>>,
    build_exit: i32,
    build_delay: Duration,
    push_exit: i32,
    fail_network: bool,
    fail_start_of: Option<String>,
    health: Mutex<HashMap<String, VecDeque<RoleStatus>>>,
    default_health: Option<RoleStatus>,
    exits: HashMap<String, ScriptedExit>,
    default_exit: Option<ScriptedExit>,
    logs: Vec<String>,
    fail_remove: bool,

    pub builds: AtomicUsize,
    pub tags: AtomicUsize,
    pub pushes: AtomicUsize,
    pub removes: AtomicUsize,
    pub health_polls: AtomicUsize,
    pub started: Mutex<Vec<ContainerSpec>>,
    pub build_requests: Mutex<Vec<BuildRequest>>,
    pub networks: Mutex<Vec<String>>,
    pub volumes: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(self, image: impl Into<String>) -> Self {
        self.images.lock().unwrap().insert(image.into());
        self
    }

    pub fn with_build_exit(mut self, code: i32) -> Self {
        self.build_exit = code;
        self
    }

    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    pub fn with_push_exit(mut self, code: i32) -> Self {
        self.push_exit = code;
        self
    }

    pub fn with_network_failure(mut self) -> Self {
        self.fail_network = true;
        self
    }

    pub fn with_start_failure(mut self, name: impl Into<String>) -> Self {
        self.fail_start_of = Some(name.into());
        self
    }

    /// Health observations for `name`, in order; the last one repeats.
    pub fn with_health(self, name: impl Into<String>, script: Vec<RoleStatus>) -> Self {
        self.health
            .lock()
            .unwrap()
            .insert(name.into(), script.into_iter().collect());
        self
    }

    /// Health reported by containers without a script.
    pub fn with_default_health(mut self, status: RoleStatus) -> Self {
        self.default_health = Some(status);
        self
    }

    pub fn with_exit(mut self, name: impl Into<String>, after: Duration, code: i32) -> Self {
        self.exits.insert(name.into(), ScriptedExit { after, code });
        self
    }

    pub fn with_default_exit(mut self, after: Duration, code: i32) -> Self {
        self.default_exit = Some(ScriptedExit { after, code });
        self
    }

    pub fn with_logs(mut self, lines: &[&str]) -> Self {
        self.logs = lines.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_remove_failure(mut self) -> Self {
        self.fail_remove = true;
        self
    }

    pub fn started_names(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    fn failed(command: &str) -> BackendError {
        BackendError::CommandFailed {
            command: command.to_string(),
            code: 125,
            stderr: "scripted failure".to_string(),
        }
    }
}

#[async_trait]
impl ContainerBackend for MockBackend {
    fn system(&self) -> ContainerSystem {
        ContainerSystem::Docker
    }

    async fn image_exists(&self, image: &str) -> Result<bool, BackendError> {
        Ok(self.images.lock().unwrap().contains(image))
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<i32, BackendError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.build_requests.lock().unwrap().push(request.clone());
        tokio::time::sleep(self.build_delay).await;
        if self.build_exit == 0 {
            let mut images = self.images.lock().unwrap();
            for tag in &request.tags {
                images.insert(tag.clone());
            }
        }
        Ok(self.build_exit)
    }

    async fn tag_image(&self, _source: &str, target: &str) -> Result<i32, BackendError> {
        self.tags.fetch_add(1, Ordering::SeqCst);
        self.images.lock().unwrap().insert(target.to_string());
        Ok(0)
    }

    async fn push_image(&self, _image: &str) -> Result<i32, BackendError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(self.push_exit)
    }

    async fn create_network(
        &self,
        name: &str,
        _labels: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        if self.fail_network {
            return Err(Self::failed("network create"));
        }
        self.networks.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        _labels: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        self.volumes.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerId, BackendError> {
        if self.fail_start_of.as_deref() == Some(spec.name.as_str()) {
            return Err(Self::failed("run"));
        }
        self.started.lock().unwrap().push(spec.clone());
        Ok(ContainerId::new(spec.name.clone()))
    }

    async fn poll_health(&self, container: &ContainerId) -> Result<RoleStatus, BackendError> {
        self.health_polls.fetch_add(1, Ordering::SeqCst);
        let mut health = self.health.lock().unwrap();
        if let Some(script) = health.get_mut(container.as_str()) {
            let status = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().copied()
            };
            if let Some(status) = status {
                return Ok(status);
            }
        }
        Ok(self.default_health.unwrap_or(RoleStatus::Healthy))
    }

    async fn stream_logs(
        &self,
        _container: &ContainerId,
        sink: mpsc::Sender<String>,
    ) -> Result<(), BackendError> {
        for line in &self.logs {
            if sink.send(line.clone()).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn await_exit(&self, container: &ContainerId) -> Result<i32, BackendError> {
        let exit = self
            .exits
            .get(container.as_str())
            .copied()
            .or(self.default_exit);
        match exit {
            Some(exit) => {
                tokio::time::sleep(exit.after).await;
                Ok(exit.code)
            }
            None => std::future::pending().await,
        }
    }

    async fn remove_resources(&self, _spec: &ClusterSpec) -> Result<(), BackendError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove {
            return Err(Self::failed("rm"));
        }
        Ok(())
    }
}

/// Fresh project directory containing a Containerfile, removed on drop.
pub fn project_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Containerfile"), "FROM scratch\n").unwrap();
    dir
}
