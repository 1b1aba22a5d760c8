//! Aggregated result of a distributed run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RoleKind;

/// Process exit codes reported by the `loadrun` binary.
pub mod exit_code {
    /// Everything succeeded.
    pub const SUCCESS: i32 = 0;
    /// Generic failure.
    pub const FAILURE: i32 = 1;
    /// Bad input rejected before any resource was created.
    pub const INVALID_TOPOLOGY: i32 = 2;
    /// Image build or push failed.
    pub const BUILD_FAILED: i32 = 3;
    /// Cluster could not be started.
    pub const LAUNCH_FAILED: i32 = 4;
    /// Cluster never converged to healthy.
    pub const HEALTH_FAILED: i32 = 5;
    /// Coordinator still running when the run timeout expired.
    pub const RUN_TIMEOUT: i32 = 6;
    /// Operator interrupted the run (128 + SIGINT).
    pub const INTERRUPTED: i32 = 130;
}

/// Terminal state of one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaExit {
    /// Container name of the replica.
    pub name: String,

    /// Role of the replica.
    pub role: RoleKind,

    /// Exit code, `None` if the replica was still running when collection ended.
    pub exit_code: Option<i32>,
}

impl ReplicaExit {
    pub fn new(name: impl Into<String>, role: RoleKind, exit_code: Option<i32>) -> Self {
        Self {
            name: name.into(),
            role,
            exit_code,
        }
    }

    /// Returns true if the replica exited with a non-zero code.
    pub fn failed(&self) -> bool {
        matches!(self.exit_code, Some(code) if code != 0)
    }
}

/// Result of supervising one run.
///
/// The coordinator is authoritative: a non-zero coordinator exit is the result.
/// A clean coordinator exit with a failed worker is still a failure, since the
/// coordinator cannot always observe a worker crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Coordinator exit.
    pub coordinator: ReplicaExit,

    /// Worker exits, in launch order.
    pub workers: Vec<ReplicaExit>,

    /// When supervision started.
    pub started_at: DateTime<Utc>,

    /// When the last exit code was collected.
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn new(
        coordinator: ReplicaExit,
        workers: Vec<ReplicaExit>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            coordinator,
            workers,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Aggregated exit code.
    pub fn code(&self) -> i32 {
        match self.coordinator.exit_code {
            Some(0) => {}
            Some(code) => return code,
            None => return exit_code::FAILURE,
        }

        self.workers
            .iter()
            .find(|w| w.failed())
            .and_then(|w| w.exit_code)
            .unwrap_or(exit_code::SUCCESS)
    }

    pub fn is_success(&self) -> bool {
        self.code() == exit_code::SUCCESS
    }

    /// Workers that exited non-zero.
    pub fn failed_workers(&self) -> impl Iterator<Item = &ReplicaExit> {
        self.workers.iter().filter(|w| w.failed())
    }

    /// Wall-clock duration of supervision.
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
