//! Distributed execution for loadrun
//!
//! Brings up a coordinator and N workers as containers, waits for them to
//! become healthy, supervises the run and always tears the cluster down.
//!
//! The phases are separate components so each can be exercised on its own:
//!
//! - [`ImageBuilder`]: make role images available
//! - [`ClusterLauncher`]: create network, volume and replicas
//! - [`HealthMonitor`]: wait for convergence
//! - [`RunSupervisor`]: collect exit codes and stream coordinator output
//! - [`TeardownController`]: remove everything, once
//!
//! [`Orchestrator`] sequences them for one invocation.

pub mod compose;
pub mod config;
pub mod error;
pub mod health;
pub mod images;
pub mod launcher;
pub mod orchestrator;
pub mod supervisor;
pub mod teardown;

#[cfg(test)]
mod testing;

pub use compose::ComposeDocument;
pub use config::{BuildOptions, DistOptions, DEFAULT_RUN_TIMEOUT};
pub use error::{DistError, HealthFailure};
pub use health::{HealthMonitor, Ready};
pub use images::{ImageBuilder, ImageSet};
pub use launcher::{ClusterLauncher, ReplicaHandle, RunHandle};
pub use orchestrator::Orchestrator;
pub use supervisor::RunSupervisor;
pub use teardown::TeardownController;
