//! Orchestrator - drives one distributed invocation from topology to teardown.

use std::sync::Arc;

use loadrun_backend::ContainerBackend;
use loadrun_core::{ClusterSpec, RunResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::compose::ComposeDocument;
use crate::config::DistOptions;
use crate::error::DistError;
use crate::health::HealthMonitor;
use crate::images::{ImageBuilder, ImageSet};
use crate::launcher::ClusterLauncher;
use crate::supervisor::RunSupervisor;
use crate::teardown::TeardownController;

/// Sequences build, launch, health wait, supervision and teardown.
pub struct Orchestrator {
    backend: Arc<dyn ContainerBackend>,
    options: DistOptions,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn ContainerBackend>, options: DistOptions) -> Self {
        Self { backend, options }
    }

    pub fn options(&self) -> &DistOptions {
        &self.options
    }

    /// Resolve the topology. Pure; nothing is created.
    pub fn topology(&self) -> Result<ClusterSpec, DistError> {
        Ok(self.options.topology()?)
    }

    /// Render the cluster without building or launching anything.
    pub fn validate(&self) -> Result<ComposeDocument, DistError> {
        let spec = self.topology()?;
        Ok(ComposeDocument::render(&spec, &self.options.health))
    }

    /// Build (and push) images only.
    pub async fn build_only(&self) -> Result<ImageSet, DistError> {
        let spec = self.topology()?;
        ImageBuilder::new(self.backend.clone())
            .build(&spec, &self.options.build)
            .await
    }

    /// Run the whole lifecycle.
    ///
    /// Coordinator output is forwarded to `output`. Cancelling `cancel` aborts
    /// the current phase and yields [`DistError::Interrupted`]. Once the
    /// topology is valid, teardown runs exactly once on every path.
    pub async fn run(
        &self,
        output: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<RunResult, DistError> {
        let spec = Arc::new(self.topology()?);
        info!(
            prefix = %spec.prefix(),
            workers = spec.worker_count(),
            system = %self.backend.system(),
            "Starting distributed run"
        );

        let teardown = TeardownController::new(self.backend.clone(), spec.clone());

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(prefix = %spec.prefix(), "Run interrupted");
                Err(DistError::Interrupted)
            }
            result = self.execute(spec.clone(), &teardown, output) => result,
        };

        teardown.teardown().await;

        match outcome {
            Ok(result) if result.is_success() => Ok(result),
            Ok(result) => Err(DistError::RunFailure(result)),
            Err(e) => Err(e),
        }
    }

    async fn execute(
        &self,
        spec: Arc<ClusterSpec>,
        teardown: &TeardownController,
        output: mpsc::Sender<String>,
    ) -> Result<RunResult, DistError> {
        let images = ImageBuilder::new(self.backend.clone())
            .build(&spec, &self.options.build)
            .await?;
        let spec = Arc::new(spec.with_images(&images));

        let handle = ClusterLauncher::new(self.backend.clone())
            .launch(spec, &self.options.health, teardown)
            .await?;

        HealthMonitor::new(self.backend.clone(), self.options.health)
            .await_healthy(&handle)
            .await?;

        RunSupervisor::new(self.backend.clone(), self.options.worker_grace)
            .with_run_timeout(self.options.run_timeout)
            .supervise(&handle, output)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildOptions;
    use crate::error::HealthFailure;
    use crate::testing::{project_dir, MockBackend};
    use loadrun_core::{exit_code, HealthPolicy, RoleStatus};
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn options(context: &Path, workers: i64) -> DistOptions {
        DistOptions {
            project: "demo".to_string(),
            context: context.to_path_buf(),
            run_id: Some("orch".to_string()),
            image_tag: "alice".to_string(),
            workers,
            health: HealthPolicy::from_secs(10, 10, 1).unwrap(),
            ..Default::default()
        }
    }

    async fn run(backend: Arc<MockBackend>, options: DistOptions) -> Result<RunResult, DistError> {
        let (tx, _rx) = mpsc::channel(64);
        Orchestrator::new(backend, options)
            .run(tx, CancellationToken::new())
            .await
    }

    /// Run with `cancel` fired after `after`.
    async fn run_cancelled_after(
        backend: Arc<MockBackend>,
        options: DistOptions,
        after: Duration,
    ) -> Result<RunResult, DistError> {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            trigger.cancel();
        });

        let (tx, _rx) = mpsc::channel(64);
        Orchestrator::new(backend, options).run(tx, cancel).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_run_tears_down_once() {
        let dir = project_dir();
        let backend = Arc::new(MockBackend::new().with_default_exit(Duration::from_secs(5), 0));

        let result = run(backend.clone(), options(dir.path(), 2)).await.unwrap();

        assert!(result.is_success());
        assert_eq!(backend.builds.load(Ordering::SeqCst), 1);
        assert_eq!(backend.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_topology_creates_nothing() {
        let dir = project_dir();
        let backend = Arc::new(MockBackend::new());

        let err = run(backend.clone(), options(dir.path(), -1)).await.unwrap_err();

        assert_eq!(err.exit_code(), exit_code::INVALID_TOPOLOGY);
        assert_eq!(backend.builds.load(Ordering::SeqCst), 0);
        assert!(backend.networks.lock().unwrap().is_empty());
        assert_eq!(backend.removes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_build_failure_tears_down_once() {
        let dir = project_dir();
        let backend = Arc::new(MockBackend::new().with_build_exit(1));

        let err = run(backend.clone(), options(dir.path(), 1)).await.unwrap_err();

        assert_eq!(err.exit_code(), exit_code::BUILD_FAILED);
        assert!(backend.started_names().is_empty());
        assert_eq!(backend.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_tears_down_once() {
        let dir = project_dir();
        let backend = Arc::new(MockBackend::new().with_start_failure("demo-orch-worker-1"));

        let err = run(backend.clone(), options(dir.path(), 2)).await.unwrap_err();

        assert_eq!(err.exit_code(), exit_code::LAUNCH_FAILED);
        assert_eq!(backend.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_timeout_tears_down_once() {
        let dir = project_dir();
        let backend = Arc::new(MockBackend::new().with_default_health(RoleStatus::Starting));
        let mut options = options(dir.path(), 2);
        options.health = HealthPolicy::from_secs(3, 100, 1).unwrap();

        let err = run(backend.clone(), options).await.unwrap_err();

        assert!(matches!(err, DistError::Health(HealthFailure::Timeout { .. })));
        assert_eq!(err.exit_code(), exit_code::HEALTH_FAILED);
        assert_eq!(backend.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_failure_tears_down_once() {
        let dir = project_dir();
        let backend = Arc::new(
            MockBackend::new()
                .with_default_exit(Duration::from_secs(2), 0)
                .with_exit("demo-orch-coordinator", Duration::from_secs(3), 1),
        );

        let err = run(backend.clone(), options(dir.path(), 2)).await.unwrap_err();

        assert!(matches!(err, DistError::RunFailure(ref r) if r.code() == 1));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(backend.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_tears_down_once() {
        // Replicas never exit.
        let dir = project_dir();
        let backend = Arc::new(MockBackend::new());
        let mut options = options(dir.path(), 1);
        options.run_timeout = Duration::from_secs(60);

        let err = run(backend.clone(), options).await.unwrap_err();

        assert!(matches!(err, DistError::RunTimeout { .. }));
        assert_eq!(err.exit_code(), exit_code::RUN_TIMEOUT);
        assert_eq!(backend.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_tears_down_once() {
        // Replicas never exit; only cancellation ends the run.
        let dir = project_dir();
        let backend = Arc::new(MockBackend::new());

        let err = run_cancelled_after(backend.clone(), options(dir.path(), 2), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, DistError::Interrupted));
        assert_eq!(err.exit_code(), exit_code::INTERRUPTED);
        assert_eq!(backend.started_names().len(), 3);
        assert_eq!(backend.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_during_build_tears_down_once() {
        let dir = project_dir();
        let backend = Arc::new(MockBackend::new().with_build_delay(Duration::from_secs(600)));

        let err = run_cancelled_after(backend.clone(), options(dir.path(), 2), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, DistError::Interrupted));
        assert_eq!(backend.builds.load(Ordering::SeqCst), 1);
        assert!(backend.started_names().is_empty());
        assert!(backend.networks.lock().unwrap().is_empty());
        assert_eq!(backend.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_during_health_wait_tears_down_once() {
        let dir = project_dir();
        let backend = Arc::new(MockBackend::new().with_default_health(RoleStatus::Starting));
        let mut options = options(dir.path(), 2);
        options.health = HealthPolicy::from_secs(600, 1000, 1).unwrap();

        let err = run_cancelled_after(backend.clone(), options, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, DistError::Interrupted));
        assert_eq!(backend.started_names().len(), 3);
        assert!(backend.health_polls.load(Ordering::SeqCst) > 0);
        assert_eq!(backend.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_image_skips_build() {
        let dir = project_dir();
        let backend = Arc::new(
            MockBackend::new()
                .with_image("demo:alice")
                .with_default_exit(Duration::from_secs(1), 0),
        );

        run(backend.clone(), options(dir.path(), 1)).await.unwrap();
        assert_eq!(backend.builds.load(Ordering::SeqCst), 0);

        let mut forced = options(dir.path(), 1);
        forced.build = BuildOptions {
            force_build: true,
            no_cache: false,
        };
        run(backend.clone(), forced).await.unwrap();
        assert_eq!(backend.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_build_only_leaves_no_generated_containerfile() {
        // No Containerfile of its own, so the embedded default is used.
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());

        let images = Orchestrator::new(backend.clone(), options(dir.path(), 1))
            .build_only()
            .await
            .unwrap();

        assert!(!images.is_empty());
        let requests = backend.build_requests.lock().unwrap();
        let used = &requests[0].containerfile;
        assert!(!used.starts_with(dir.path()));
        assert!(!used.exists());
        assert_eq!(backend.removes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_validate_renders_without_backend_calls() {
        let dir = project_dir();
        let backend = Arc::new(MockBackend::new());
        let doc = Orchestrator::new(backend.clone(), options(dir.path(), 3))
            .validate()
            .unwrap();

        assert_eq!(doc.services.len(), 4);
        assert!(backend.started_names().is_empty());
    }
}
