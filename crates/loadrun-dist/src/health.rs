//! Health monitor - waits for every replica to report healthy.
//!
//! One polling task per replica. The wait as a whole is bounded by the policy
//! timeout, and the first replica that exits or turns unhealthy ends it early.

use std::sync::Arc;
use std::time::Duration;

use loadrun_backend::ContainerBackend;
use loadrun_core::{HealthPolicy, RoleKind, RoleStatus};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::HealthFailure;
use crate::launcher::{ReplicaHandle, RunHandle};

/// Every replica reported healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub elapsed: Duration,
}

/// How polling one replica ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Healthy,
    Failed(RoleStatus),
    /// All polls used up without a verdict.
    Exhausted,
}

/// Polls replicas until the cluster is ready or the policy gives up.
pub struct HealthMonitor {
    backend: Arc<dyn ContainerBackend>,
    policy: HealthPolicy,
}

impl HealthMonitor {
    pub fn new(backend: Arc<dyn ContainerBackend>, policy: HealthPolicy) -> Self {
        Self { backend, policy }
    }

    /// Wait until every replica of `handle` is healthy.
    ///
    /// Never tears anything down; the caller owns cleanup.
    pub async fn await_healthy(&self, handle: &RunHandle) -> Result<Ready, HealthFailure> {
        let started = Instant::now();
        let deadline = started + self.policy.timeout();

        let mut tasks = JoinSet::new();
        for replica in handle.replicas() {
            let backend = self.backend.clone();
            let replica = replica.clone();
            let policy = self.policy;
            tasks.spawn(async move {
                let outcome = poll_replica(backend.as_ref(), &replica, &policy).await;
                (replica, outcome)
            });
        }

        let mut pending: Vec<String> = handle.replicas().iter().map(|r| r.name.clone()).collect();

        let waited = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = tasks.join_next().await {
                let (replica, outcome) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        warn!(error = %e, "Health polling task failed");
                        continue;
                    }
                };

                match outcome {
                    Outcome::Healthy => {
                        debug!(replica = %replica.name, "Replica healthy");
                        pending.retain(|name| name != &replica.name);
                    }
                    Outcome::Exhausted => {
                        debug!(replica = %replica.name, "Health retries exhausted");
                    }
                    Outcome::Failed(status) => {
                        let (replica, status) = self
                            .prefer_coordinator(&mut tasks, handle, &pending, replica, status)
                            .await;
                        return Err(failure(&replica, status));
                    }
                }
            }
            Ok(())
        })
        .await;
        tasks.abort_all();

        let elapsed = started.elapsed();
        match waited {
            Ok(Err(err)) => {
                warn!(error = %err, "Replica failed before becoming healthy");
                Err(err)
            }
            Ok(Ok(())) if pending.is_empty() => {
                info!(?elapsed, replicas = handle.replicas().len(), "Cluster healthy");
                Ok(Ready { elapsed })
            }
            Ok(Ok(())) | Err(_) => {
                warn!(?elapsed, pending = pending.len(), "Cluster not healthy in time");
                Err(HealthFailure::Timeout { pending, elapsed })
            }
        }
    }

    /// Coordinator failures win over worker failures from the same poll round.
    async fn prefer_coordinator(
        &self,
        tasks: &mut JoinSet<(ReplicaHandle, Outcome)>,
        handle: &RunHandle,
        pending: &[String],
        replica: ReplicaHandle,
        status: RoleStatus,
    ) -> (ReplicaHandle, RoleStatus) {
        if replica.role == RoleKind::Coordinator {
            return (replica, status);
        }
        while let Some(joined) = tasks.try_join_next() {
            if let Ok((other, Outcome::Failed(other_status))) = joined {
                if other.role == RoleKind::Coordinator {
                    return (other, other_status);
                }
            }
        }

        // Its polling task may not have observed this round yet.
        let Some(coordinator) = handle
            .replicas()
            .iter()
            .find(|r| r.role == RoleKind::Coordinator && pending.contains(&r.name))
        else {
            return (replica, status);
        };
        let polled = tokio::time::timeout(
            self.policy.interval(),
            self.backend.poll_health(&coordinator.container),
        )
        .await;
        match polled {
            Ok(Ok(observed @ (RoleStatus::Exited(_) | RoleStatus::Unhealthy))) => {
                (coordinator.clone(), observed)
            }
            _ => (replica, status),
        }
    }
}

fn failure(replica: &ReplicaHandle, status: RoleStatus) -> HealthFailure {
    match status {
        RoleStatus::Exited(code) => HealthFailure::Exited {
            replica: replica.name.clone(),
            code,
        },
        _ => HealthFailure::Unhealthy {
            replica: replica.name.clone(),
        },
    }
}

async fn poll_replica(
    backend: &dyn ContainerBackend,
    replica: &ReplicaHandle,
    policy: &HealthPolicy,
) -> Outcome {
    let mut ticker = tokio::time::interval(policy.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut status = RoleStatus::default();
    for attempt in 0..=policy.retries() {
        ticker.tick().await;
        match backend.poll_health(&replica.container).await {
            Ok(observed) => {
                if status.transition(observed).is_err() {
                    debug!(replica = %replica.name, from = %status, to = %observed, "Ignoring status regression");
                }
                match status {
                    RoleStatus::Healthy => return Outcome::Healthy,
                    RoleStatus::Exited(_) | RoleStatus::Unhealthy => {
                        return Outcome::Failed(status)
                    }
                    RoleStatus::Starting => {}
                }
            }
            Err(e) => {
                debug!(replica = %replica.name, attempt, error = %e, "Health poll failed");
            }
        }
    }
    Outcome::Exhausted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::ClusterLauncher;
    use crate::teardown::TeardownController;
    use crate::testing::MockBackend;
    use loadrun_core::{ClusterSpec, RunId, TopologyBuilder};
    use std::sync::atomic::Ordering;

    async fn launch(backend: Arc<MockBackend>, workers: i64) -> RunHandle {
        let spec: Arc<ClusterSpec> = Arc::new(
            TopologyBuilder::new("demo", RunId::parse("health").unwrap())
                .worker_count(workers)
                .build()
                .unwrap(),
        );
        let teardown = TeardownController::new(backend.clone(), spec.clone());
        let handle = ClusterLauncher::new(backend)
            .launch(spec, &HealthPolicy::default(), &teardown)
            .await
            .unwrap();
        // Nothing to clean up in the mock; keep the drop fallback quiet.
        teardown.teardown().await;
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_healthy() {
        let backend = Arc::new(
            MockBackend::new()
                .with_health("demo-health-worker-1", vec![RoleStatus::Starting, RoleStatus::Healthy]),
        );
        let handle = launch(backend.clone(), 2).await;
        let monitor = HealthMonitor::new(backend, HealthPolicy::from_secs(10, 5, 1).unwrap());

        let ready = monitor.await_healthy(&handle).await.unwrap();

        assert!(ready.elapsed >= Duration::from_secs(1));
        assert!(ready.elapsed < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds_the_wait() {
        let backend = Arc::new(MockBackend::new().with_default_health(RoleStatus::Starting));
        let handle = launch(backend.clone(), 2).await;
        let monitor = HealthMonitor::new(backend, HealthPolicy::from_secs(3, 100, 1).unwrap());

        let started = Instant::now();
        let err = monitor.await_healthy(&handle).await.unwrap_err();

        assert!(started.elapsed() <= Duration::from_secs(3));
        match err {
            HealthFailure::Timeout { pending, .. } => assert_eq!(pending.len(), 3),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_reports_pending() {
        let backend = Arc::new(
            MockBackend::new().with_health("demo-health-worker-1", vec![RoleStatus::Starting]),
        );
        let handle = launch(backend.clone(), 1).await;
        let monitor = HealthMonitor::new(backend.clone(), HealthPolicy::from_secs(60, 2, 1).unwrap());

        let err = monitor.await_healthy(&handle).await.unwrap_err();

        assert!(matches!(err, HealthFailure::Timeout { .. }));
        assert_eq!(err.replicas(), vec!["demo-health-worker-1"]);
        // coordinator: 1 poll, worker: 1 + 2 retries
        assert_eq!(backend.health_polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_exit_short_circuits() {
        let backend = Arc::new(
            MockBackend::new()
                .with_default_health(RoleStatus::Starting)
                .with_health("demo-health-worker-2", vec![RoleStatus::Exited(1)]),
        );
        let handle = launch(backend.clone(), 3).await;
        let monitor = HealthMonitor::new(backend, HealthPolicy::from_secs(60, 100, 1).unwrap());

        let started = Instant::now();
        let err = monitor.await_healthy(&handle).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(
            err,
            HealthFailure::Exited {
                replica: "demo-health-worker-2".to_string(),
                code: 1,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_failure_wins_same_round() {
        let backend = Arc::new(
            MockBackend::new()
                .with_health(
                    "demo-health-coordinator",
                    vec![RoleStatus::Starting, RoleStatus::Exited(2)],
                )
                .with_health(
                    "demo-health-worker-1",
                    vec![RoleStatus::Starting, RoleStatus::Exited(1)],
                ),
        );
        let handle = launch(backend.clone(), 1).await;
        let monitor = HealthMonitor::new(backend, HealthPolicy::from_secs(60, 10, 1).unwrap());

        let err = monitor.await_healthy(&handle).await.unwrap_err();

        assert_eq!(
            err,
            HealthFailure::Exited {
                replica: "demo-health-coordinator".to_string(),
                code: 2,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_failure_wins_over_earlier_worker() {
        // Every replica fails on its first poll.
        let backend = Arc::new(
            MockBackend::new()
                .with_health("demo-health-worker-1", vec![RoleStatus::Exited(1)])
                .with_health("demo-health-worker-2", vec![RoleStatus::Exited(1)])
                .with_health("demo-health-coordinator", vec![RoleStatus::Exited(2)]),
        );
        let handle = launch(backend.clone(), 2).await;
        let monitor = HealthMonitor::new(backend, HealthPolicy::from_secs(60, 10, 1).unwrap());

        let err = monitor.await_healthy(&handle).await.unwrap_err();

        assert_eq!(err.replicas(), vec!["demo-health-coordinator"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_replica_fails() {
        let backend = Arc::new(MockBackend::new().with_health(
            "demo-health-coordinator",
            vec![RoleStatus::Starting, RoleStatus::Unhealthy],
        ));
        let handle = launch(backend.clone(), 1).await;
        let monitor = HealthMonitor::new(backend, HealthPolicy::from_secs(60, 10, 1).unwrap());

        let err = monitor.await_healthy(&handle).await.unwrap_err();

        assert_eq!(err.replicas(), vec!["demo-health-coordinator"]);
    }
}
