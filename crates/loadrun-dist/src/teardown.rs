//! Teardown controller - removes everything a run created.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loadrun_backend::ContainerBackend;
use loadrun_core::ClusterSpec;
use tracing::{debug, info, warn};

/// Upper bound on one removal pass.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Removes the labelled containers, network and volume of one run.
///
/// Effective at most once: later calls are no-ops. If the controller is
/// dropped without having run (panic, aborted task) a removal is spawned on the
/// current runtime.
pub struct TeardownController {
    backend: Arc<dyn ContainerBackend>,
    spec: Arc<ClusterSpec>,
    done: AtomicBool,
    timeout: Duration,
}

impl TeardownController {
    pub fn new(backend: Arc<dyn ContainerBackend>, spec: Arc<ClusterSpec>) -> Self {
        Self {
            backend,
            spec,
            done: AtomicBool::new(false),
            timeout: TEARDOWN_TIMEOUT,
        }
    }

    /// Override the removal timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns true once teardown has been performed.
    pub fn has_run(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Remove all resources of the run. Failures are logged, never returned.
    pub async fn teardown(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            debug!(prefix = %self.spec.prefix(), "Teardown already performed");
            return;
        }

        info!(prefix = %self.spec.prefix(), "Tearing down cluster");
        remove(self.backend.as_ref(), &self.spec, self.timeout).await;
    }
}

impl Drop for TeardownController {
    fn drop(&mut self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                prefix = %self.spec.prefix(),
                "No runtime available, cluster resources may be left behind"
            );
            return;
        };

        warn!(prefix = %self.spec.prefix(), "Teardown not run, cleaning up in background");
        let backend = self.backend.clone();
        let spec = self.spec.clone();
        let timeout = self.timeout;
        runtime.spawn(async move {
            remove(backend.as_ref(), &spec, timeout).await;
        });
    }
}

async fn remove(backend: &dyn ContainerBackend, spec: &ClusterSpec, timeout: Duration) {
    match tokio::time::timeout(timeout, backend.remove_resources(spec)).await {
        Ok(Ok(())) => info!(prefix = %spec.prefix(), "Cluster resources removed"),
        Ok(Err(e)) => warn!(prefix = %spec.prefix(), error = %e, "Teardown failed"),
        Err(_) => warn!(prefix = %spec.prefix(), ?timeout, "Teardown timed out"),
    }
}
