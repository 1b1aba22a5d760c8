//! Newtype wrapper for the run identifier.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::CoreError;

/// Identifier namespacing every resource created for one invocation.
///
/// Only lowercase ASCII letters, digits, `-` and `_` are accepted so the id can
/// be embedded verbatim in container, network and volume names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    /// Parse a user-supplied run id.
    ///
    /// Uppercase letters are folded to lowercase; anything else outside the
    /// allowed alphabet is rejected.
    pub fn parse(id: impl AsRef<str>) -> Result<Self, CoreError> {
        let id = id.as_ref().trim().to_ascii_lowercase();

        if id.is_empty() {
            return Err(CoreError::InvalidInput("run id cannot be empty".to_string()));
        }

        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
        {
            return Err(CoreError::InvalidInput(format!(
                "run id '{}' contains invalid character '{}'",
                id, c
            )));
        }

        Ok(Self(id))
    }

    /// Generate a new random RunId.
    pub fn generate() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self(id)
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
