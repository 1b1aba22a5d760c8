//! Per-replica status.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CoreError;

/// Observed state of one role replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleStatus {
    /// Container created or running, health not yet established.
    #[default]
    Starting,
    /// Health check passed (or the image defines none and the container runs).
    Healthy,
    /// Health check failed for good.
    Unhealthy,
    /// Container terminated with the given exit code.
    Exited(i32),
}

impl RoleStatus {
    /// Returns true if no further transition is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unhealthy | Self::Exited(_))
    }

    /// Returns true if moving from `self` to `next` is allowed.
    ///
    /// Re-observing the same state is always allowed.
    pub fn can_transition_to(&self, next: RoleStatus) -> bool {
        if *self == next {
            return true;
        }
        match (self, next) {
            (Self::Starting, _) => true,
            (Self::Healthy, Self::Exited(_)) => true,
            _ => false,
        }
    }

    /// Validate and apply a transition.
    pub fn transition(&mut self, next: RoleStatus) -> Result<(), CoreError> {
        if !self.can_transition_to(next) {
            return Err(CoreError::InvalidStatusTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for RoleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Exited(code) => write!(f, "exited({})", code),
        }
    }
}
