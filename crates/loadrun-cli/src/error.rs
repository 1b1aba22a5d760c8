//! CLI-level errors and their exit codes.

use loadrun_core::exit_code;
use loadrun_dist::DistError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    /// Options that parse but make no sense together.
    #[error("{0}")]
    Usage(String),

    /// Something the invocation needs is missing on this host.
    #[error("{0}")]
    Precondition(String),

    /// The operator declined a confirmation prompt.
    #[error("aborted")]
    Aborted,

    /// Ctrl-C during local mode.
    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Dist(#[from] DistError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl CliError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => exit_code::INVALID_TOPOLOGY,
            Self::Precondition(_) | Self::Aborted | Self::Io { .. } => exit_code::FAILURE,
            Self::Interrupted => exit_code::INTERRUPTED,
            Self::Dist(e) => e.exit_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Usage("bad".into()).exit_code(), 2);
        assert_eq!(CliError::Aborted.exit_code(), 1);
        assert_eq!(CliError::Interrupted.exit_code(), 130);
        assert_eq!(CliError::Dist(DistError::Interrupted).exit_code(), 130);
        assert_eq!(CliError::Aborted.to_string(), "aborted");
    }
}
