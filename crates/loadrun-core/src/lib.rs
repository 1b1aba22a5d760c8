//! loadrun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Container engines or subprocesses
//! - Async runtimes
//! - Terminal I/O
//!
//! All types here describe a distributed load-test cluster: its topology,
//! the health policy used to wait for it, per-replica status and the
//! aggregated result of a run.

pub mod error;
pub mod ids;
pub mod result;
pub mod status;
pub mod topology;

// Re-export commonly used types
pub use error::CoreError;
pub use ids::RunId;
pub use result::{exit_code, ReplicaExit, RunResult};
pub use status::RoleStatus;
pub use topology::{
    normalize_registry, ClusterSpec, ContainerSystem, HealthPolicy, ResourcePolicy, Role,
    RoleKind, RunSettings, TopologyBuilder,
};
