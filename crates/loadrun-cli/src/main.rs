//! loadrun CLI - run load tests locally or distributed over containers.

mod args;
mod dist;
mod error;
mod local;

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::warn;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::args::{Cli, Command, LocalCommand};
use crate::error::CliError;

fn init_tracing(verbose: bool) -> Result<(), SetGlobalDefaultError> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // Logs go to stderr; stdout carries test output.
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
}

/// Cancel `token` on the first Ctrl-C.
fn watch_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl-C, shutting down");
            token.cancel();
        }
    });
}

async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<i32, CliError> {
    match cli.command {
        Command::Local {
            command: LocalCommand::Run(run),
        } => local::run(run, cancel).await,
        Command::Dist(args) => dist::run(args, cancel).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.verbose()) {
        eprintln!("!! cannot set up logging: {}", e);
        return ExitCode::FAILURE;
    }

    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());

    let code = match dispatch(cli, cancel).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("!! {}", e);
            e.exit_code()
        }
    };

    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
