//! Core domain errors.

use thiserror::Error;

use crate::RoleStatus;

/// Core domain errors for loadrun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The requested cluster shape cannot be built.
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// Invalid health policy values.
    #[error("Invalid health policy: {0}")]
    InvalidHealthPolicy(String),

    /// Invalid status transition.
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidStatusTransition { from: RoleStatus, to: RoleStatus },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
