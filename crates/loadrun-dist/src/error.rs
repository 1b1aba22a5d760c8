//! Orchestrator error taxonomy.

use std::time::Duration;

use loadrun_backend::BackendError;
use loadrun_core::{exit_code, CoreError, RoleKind, RunResult};
use thiserror::Error;

/// Why the cluster never became ready.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HealthFailure {
    /// Budget exhausted with some replicas still not healthy.
    #[error("replicas not healthy after {elapsed:?}: {}", .pending.join(", "))]
    Timeout {
        pending: Vec<String>,
        elapsed: Duration,
    },

    /// A replica terminated before it ever reported healthy.
    #[error("{replica} exited with code {code} before becoming healthy")]
    Exited { replica: String, code: i32 },

    /// A replica's health check failed for good.
    #[error("{replica} reported unhealthy")]
    Unhealthy { replica: String },
}

impl HealthFailure {
    /// Replicas the failure is about.
    pub fn replicas(&self) -> Vec<&str> {
        match self {
            Self::Timeout { pending, .. } => pending.iter().map(String::as_str).collect(),
            Self::Exited { replica, .. } | Self::Unhealthy { replica } => vec![replica.as_str()],
        }
    }
}

/// Errors surfaced by the distributed orchestrator.
#[derive(Debug, Error)]
pub enum DistError {
    /// Bad input, rejected before any resource was created.
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// Image build, tag or push exited non-zero. Nothing was launched.
    #[error("Building {role} image '{image}' failed with exit code {exit_code}")]
    Build {
        role: RoleKind,
        image: String,
        exit_code: i32,
    },

    /// Preparing the build context failed.
    #[error("Failed to prepare build context: {0}")]
    BuildContext(#[source] std::io::Error),

    /// Cluster creation failed part-way; created resources were removed.
    #[error("Failed to launch {resource}: {source}")]
    Launch {
        resource: String,
        #[source]
        source: BackendError,
    },

    /// Cluster never converged.
    #[error("Cluster not healthy: {0}")]
    Health(#[from] HealthFailure),

    /// The run completed with a non-zero aggregated result.
    #[error("Run failed with exit code {}", .0.code())]
    RunFailure(RunResult),

    /// The coordinator did not finish within the run timeout.
    #[error("Coordinator still running after {timeout:?}")]
    RunTimeout { timeout: Duration },

    /// The operator cancelled the run.
    #[error("Interrupted")]
    Interrupted,

    /// Engine invocation error outside a more specific phase.
    #[error("Container engine error: {0}")]
    Backend(#[from] BackendError),
}

impl DistError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidTopology(_) => exit_code::INVALID_TOPOLOGY,
            Self::Build { .. } | Self::BuildContext(_) => exit_code::BUILD_FAILED,
            Self::Launch { .. } => exit_code::LAUNCH_FAILED,
            Self::Health(_) => exit_code::HEALTH_FAILED,
            Self::RunFailure(result) => result.code(),
            Self::RunTimeout { .. } => exit_code::RUN_TIMEOUT,
            Self::Interrupted => exit_code::INTERRUPTED,
            Self::Backend(_) => exit_code::FAILURE,
        }
    }
}

impl From<CoreError> for DistError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidTopology(reason) => Self::InvalidTopology(reason),
            other => Self::InvalidTopology(other.to_string()),
        }
    }
}
