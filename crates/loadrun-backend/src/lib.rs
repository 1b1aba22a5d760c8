//! Container engine backends for loadrun
//!
//! This crate drives a container engine (Docker or Podman) through its CLI and
//! exposes it behind the [`ContainerBackend`] capability set the distributed
//! orchestrator depends on.
//!
//! # Example
//!
//! ```rust,no_run
//! use loadrun_backend::{backend_for, ContainerBackend};
//! use loadrun_core::ContainerSystem;
//!
//! async fn check() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = backend_for(ContainerSystem::Docker);
//!     let exists = backend.image_exists("my-project:latest").await?;
//!     println!("image present: {}", exists);
//!     Ok(())
//! }
//! ```

mod backend;
mod cli;
mod dialect;
mod error;

// Re-export main types
pub use backend::{
    BuildRequest, ContainerBackend, ContainerId, ContainerSpec, HealthCheck, Mount, MountKind,
};
pub use cli::{backend_for, probe, CliBackend, DockerBackend, PodmanBackend};
pub use dialect::{parse_health, Dialect, Docker, Podman};
pub use error::BackendError;
