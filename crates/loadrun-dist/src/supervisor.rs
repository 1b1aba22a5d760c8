//! Run supervisor - collects replica exit codes while streaming coordinator
//! output to the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use loadrun_backend::{BackendError, ContainerBackend};
use loadrun_core::{ReplicaExit, RoleKind, RunResult};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_RUN_TIMEOUT;
use crate::error::DistError;
use crate::launcher::RunHandle;

/// Waits for a launched cluster to finish.
pub struct RunSupervisor {
    backend: Arc<dyn ContainerBackend>,
    grace: Duration,
    run_timeout: Duration,
}

impl RunSupervisor {
    /// `grace` bounds how long workers may outlive the coordinator.
    pub fn new(backend: Arc<dyn ContainerBackend>, grace: Duration) -> Self {
        Self {
            backend,
            grace,
            run_timeout: DEFAULT_RUN_TIMEOUT,
        }
    }

    /// Bound the wait for the coordinator's exit.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Supervise the run until the coordinator exits and the workers either
    /// exit or run out of grace.
    ///
    /// Coordinator output is forwarded to `output` line by line. A full or
    /// closed channel never delays exit collection. A coordinator still
    /// running after the run timeout yields [`DistError::RunTimeout`].
    pub async fn supervise(
        &self,
        handle: &RunHandle,
        output: mpsc::Sender<String>,
    ) -> Result<RunResult, DistError> {
        let started_at = Utc::now();
        let replicas = handle.replicas();
        let Some(coordinator_index) = replicas
            .iter()
            .position(|r| r.role == RoleKind::Coordinator)
        else {
            return Err(DistError::InvalidTopology(
                "cluster has no coordinator".to_string(),
            ));
        };

        let mut logs = JoinSet::new();
        {
            let backend = self.backend.clone();
            let container = replicas[coordinator_index].container.clone();
            logs.spawn(async move { backend.stream_logs(&container, output).await });
        }

        let mut exits: JoinSet<(usize, Result<i32, BackendError>)> = JoinSet::new();
        for (index, replica) in replicas.iter().enumerate() {
            let backend = self.backend.clone();
            let container = replica.container.clone();
            exits.spawn(async move { (index, backend.await_exit(&container).await) });
        }

        let mut codes: Vec<Option<i32>> = vec![None; replicas.len()];

        // Until the coordinator is done.
        let coordinator_done = tokio::time::timeout(self.run_timeout, async {
            while let Some(joined) = exits.join_next().await {
                let Ok((index, result)) = joined else {
                    continue;
                };
                let replica = &replicas[index];
                match result {
                    Ok(code) => {
                        info!(replica = %replica.name, role = %replica.role, code, "Replica exited");
                        codes[index] = Some(code);
                    }
                    Err(e) if index == coordinator_index => {
                        warn!(replica = %replica.name, error = %e, "Lost track of coordinator");
                        return Err(DistError::Backend(e));
                    }
                    Err(e) => {
                        warn!(replica = %replica.name, error = %e, "Failed to collect exit code");
                    }
                }
                if index == coordinator_index {
                    break;
                }
            }
            Ok(())
        })
        .await;

        match coordinator_done {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                exits.abort_all();
                logs.abort_all();
                return Err(e);
            }
            Err(_) => {
                warn!(timeout = ?self.run_timeout, "Coordinator did not finish in time");
                exits.abort_all();
                logs.abort_all();
                return Err(DistError::RunTimeout {
                    timeout: self.run_timeout,
                });
            }
        }

        // Workers still running get the grace period.
        if !exits.is_empty() {
            debug!(remaining = exits.len(), grace = ?self.grace, "Waiting for workers");
            let drained = tokio::time::timeout(self.grace, async {
                while let Some(joined) = exits.join_next().await {
                    match joined {
                        Ok((index, Ok(code))) => {
                            info!(replica = %replicas[index].name, code, "Replica exited");
                            codes[index] = Some(code);
                        }
                        Ok((index, Err(e))) => {
                            warn!(replica = %replicas[index].name, error = %e, "Failed to collect exit code");
                        }
                        Err(_) => {}
                    }
                }
            })
            .await;
            if drained.is_err() {
                warn!(remaining = exits.len(), "Workers still running after grace period");
            }
            exits.abort_all();
        }

        // Let the log stream deliver what the coordinator wrote last.
        if tokio::time::timeout(self.grace, logs.join_next()).await.is_err() {
            debug!("Log stream did not end, dropping it");
        }
        logs.abort_all();

        let coordinator = &replicas[coordinator_index];
        let workers = replicas
            .iter()
            .zip(&codes)
            .filter(|(r, _)| r.role == RoleKind::Worker)
            .map(|(r, code)| ReplicaExit::new(r.name.clone(), r.role, *code))
            .collect();

        let result = RunResult::new(
            ReplicaExit::new(
                coordinator.name.clone(),
                coordinator.role,
                codes[coordinator_index],
            ),
            workers,
            started_at,
        );

        info!(code = result.code(), failed_workers = result.failed_workers().count(), "Run finished");
        Ok(result)
    }
}
