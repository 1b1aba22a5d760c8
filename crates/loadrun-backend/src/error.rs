//! Error types for container engine invocations.

use thiserror::Error;

/// Errors that can occur while driving a container engine CLI.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Engine executable not found.
    #[error("'{0}' not found in PATH. Ensure it is installed.")]
    NotInstalled(String),

    /// Failed to spawn the engine process.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Engine command exited non-zero.
    #[error("`{command}` exited with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Engine output could not be interpreted.
    #[error("Unexpected output from `{command}`: {output}")]
    UnexpectedOutput { command: String, output: String },

    /// Some resources of a run could not be removed.
    #[error("Cleanup incomplete: {}", join_errors(.0))]
    Cleanup(Vec<BackendError>),

    /// I/O error while talking to the engine process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[BackendError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
