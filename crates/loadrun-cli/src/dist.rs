//! `loadrun dist`: resolve options and hand them to the orchestrator.

use std::path::PathBuf;

use loadrun_backend::{backend_for, probe};
use loadrun_core::exit_code;
use loadrun_dist::{DistError, Orchestrator};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::args::{check_limit_nofile, confirm, DistArgs, DistCommand};
use crate::error::CliError;

/// Buffered coordinator output lines.
const OUTPUT_BUFFER: usize = 1024;

/// Image tag for this invocation: the invoking user, so users sharing a
/// registry do not overwrite each other.
fn image_tag() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "latest".to_string())
}

fn project_dir() -> Result<PathBuf, CliError> {
    let cwd = std::env::current_dir()
        .map_err(|e| CliError::io("cannot read working directory", e))?;
    cwd.canonicalize()
        .map_err(|e| CliError::io(format!("cannot resolve {}", cwd.display()), e))
}

pub async fn run(args: DistArgs, cancel: CancellationToken) -> Result<i32, CliError> {
    let options = args.options(project_dir()?, image_tag())?;

    if args.validate_config {
        let doc = Orchestrator::new(backend_for(options.container_system), options).validate()?;
        let json = doc
            .to_json()
            .map_err(|e| CliError::Usage(format!("cannot render cluster definition: {}", e)))?;
        println!("{}", json);
        return Ok(exit_code::SUCCESS);
    }

    check_limit_nofile(options.resources.limit_nofile, args.assume_yes(), || {
        confirm("are you sure you know what you are doing?")
    })
    .await?;

    let system = options.container_system;
    let version = probe(system).await.map_err(|e| {
        debug!(error = %e, "Container system probe failed");
        CliError::Precondition(format!("{} not found in PATH, cannot run distributed", system))
    })?;
    debug!(%system, %version, "Container system available");

    let orchestrator = Orchestrator::new(backend_for(system), options);

    match args.command {
        DistCommand::Build(_) => {
            let images = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DistError::Interrupted),
                images = orchestrator.build_only() => images,
            }?;
            for (role, image) in &images {
                info!(%role, %image, "Image ready");
            }
            Ok(exit_code::SUCCESS)
        }
        DistCommand::Run(_) => {
            let (tx, mut rx) = mpsc::channel::<String>(OUTPUT_BUFFER);
            let printer = tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    println!("{}", line);
                }
            });

            let outcome = orchestrator.run(tx, cancel).await;
            // Sender is gone once run returns; drain what is left.
            let _ = printer.await;

            let result = outcome?;
            info!(
                code = result.code(),
                duration_secs = result.duration().num_seconds(),
                "Distributed run complete"
            );
            Ok(result.code())
        }
    }
}
