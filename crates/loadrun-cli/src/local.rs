//! Local mode: run the test runner directly on this host.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use loadrun_core::{exit_code, RunSettings};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::args::RunArgs;
use crate::error::CliError;

/// Test runner executed for every feature file.
const RUNNER: &str = "behave";

/// Look up `program` on `PATH`.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Child command for `settings`; variables go to the child only.
pub fn runner_command(program: &Path, settings: &RunSettings) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(settings.runner_args())
        .envs(settings.environment())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    cmd
}

pub async fn run(args: RunArgs, cancel: CancellationToken) -> Result<i32, CliError> {
    let settings = args.settings()?;
    let program = find_in_path(RUNNER).ok_or_else(|| {
        CliError::Precondition(format!("\"{}\" not found in PATH, needed when running local mode", RUNNER))
    })?;

    info!(runner = %program.display(), file = %settings.run_file, "Running locally");
    let mut child = runner_command(&program, &settings)
        .spawn()
        .map_err(|e| CliError::io(format!("failed to start {}", RUNNER), e))?;

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| CliError::io(format!("failed to wait for {}", RUNNER), e))?;
            Ok(status.code().unwrap_or(exit_code::FAILURE))
        }
        _ = cancel.cancelled() => {
            warn!("Interrupted, stopping {}", RUNNER);
            let _ = child.kill().await;
            Err(CliError::Interrupted)
        }
    }
}
