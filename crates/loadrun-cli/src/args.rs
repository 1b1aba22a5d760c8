//! Command line arguments and option resolution.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use loadrun_core::{ContainerSystem, HealthPolicy, ResourcePolicy, RunSettings};
use loadrun_dist::{BuildOptions, DistOptions, DEFAULT_RUN_TIMEOUT};

use crate::error::CliError;

/// Lowest `--limit-nofile` the load generator runs quietly with.
pub const RECOMMENDED_LIMIT_NOFILE: u64 = 10001;

/// loadrun - run behave/locust load tests locally or on a container cluster
#[derive(Debug, Parser)]
#[command(name = "loadrun", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run in this process environment
    Local {
        #[command(subcommand)]
        command: LocalCommand,
    },

    /// Run on a coordinator and workers in containers
    Dist(DistArgs),
}

#[derive(Debug, Subcommand)]
pub enum LocalCommand {
    /// Execute a feature file
    Run(RunArgs),
}

#[derive(Debug, Subcommand)]
pub enum DistCommand {
    /// Execute a feature file on the cluster
    Run(RunArgs),

    /// Build (and push) the project image only
    Build(BuildArgs),
}

/// Options shared by `dist` subcommands.
#[derive(Debug, Args)]
pub struct DistArgs {
    /// Number of worker containers
    #[arg(short, long, default_value_t = 1, allow_negative_numbers = true)]
    pub workers: i64,

    /// Run id; names every resource of this run
    #[arg(long)]
    pub id: Option<String>,

    /// Open file descriptor limit inside the containers
    #[arg(long, default_value_t = RECOMMENDED_LIMIT_NOFILE)]
    pub limit_nofile: u64,

    /// Container engine to use
    #[arg(long, default_value = "docker", value_parser = parse_container_system)]
    pub container_system: ContainerSystem,

    /// Seconds to wait for the cluster to become healthy
    #[arg(long, default_value_t = 60)]
    pub health_timeout: u64,

    /// Health polls after the first one
    #[arg(long, default_value_t = 30)]
    pub health_retries: u32,

    /// Seconds between health polls
    #[arg(long, default_value_t = 2)]
    pub health_interval: u64,

    /// Seconds workers may run on after the coordinator exits
    #[arg(long, default_value_t = 10)]
    pub worker_grace: u64,

    /// Seconds to wait for the coordinator to finish before giving up
    #[arg(long, default_value_t = DEFAULT_RUN_TIMEOUT.as_secs())]
    pub run_timeout: u64,

    /// Registry to tag and push images to
    #[arg(long)]
    pub registry: Option<String>,

    /// Allocate a pseudo-TTY for every container
    #[arg(long)]
    pub tty: bool,

    /// Rebuild the image before running
    #[arg(long, conflicts_with_all = ["force_build", "validate_config"])]
    pub build: bool,

    /// Rebuild the image without cache before running
    #[arg(long, conflicts_with = "validate_config")]
    pub force_build: bool,

    /// Print the cluster definition and exit
    #[arg(long)]
    pub validate_config: bool,

    #[command(subcommand)]
    pub command: DistCommand,
}

/// Options of `run`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Feature file to execute
    pub file: PathBuf,

    /// Environment file handed to the test run
    #[arg(short = 'e', long)]
    pub environment_file: Option<PathBuf>,

    /// Test data variable, NAME=VALUE (repeatable)
    #[arg(short = 'T', long = "testdata-variable", value_parser = parse_testdata)]
    pub testdata: Vec<(String, String)>,

    /// Verbose test runner and log output
    #[arg(long)]
    pub verbose: bool,

    /// Answer yes to every question
    #[arg(short, long)]
    pub yes: bool,
}

/// Options of `dist build`.
#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Build without layer cache
    #[arg(long)]
    pub no_cache: bool,

    /// Registry to tag and push images to
    #[arg(long)]
    pub registry: Option<String>,
}

impl Cli {
    /// Whether debug logging was asked for.
    pub fn verbose(&self) -> bool {
        match &self.command {
            Command::Local {
                command: LocalCommand::Run(run),
            } => run.verbose,
            Command::Dist(dist) => match &dist.command {
                DistCommand::Run(run) => run.verbose,
                DistCommand::Build(_) => false,
            },
        }
    }
}

impl RunArgs {
    /// Check the feature file and build the run settings.
    pub fn settings(&self) -> Result<RunSettings, CliError> {
        if !self.file.is_file() {
            return Err(CliError::Usage(format!(
                "{} does not exist",
                self.file.display()
            )));
        }
        if let Some(env) = &self.environment_file {
            if !env.is_file() {
                return Err(CliError::Usage(format!("{} does not exist", env.display())));
            }
        }

        Ok(RunSettings {
            run_file: path_string(&self.file),
            environment_file: self.environment_file.as_deref().map(path_string),
            testdata: self.testdata.iter().cloned().collect::<BTreeMap<_, _>>(),
            verbose: self.verbose,
        })
    }
}

impl DistArgs {
    /// Map the build flags.
    ///
    /// `dist build` always builds, `--no-cache` without cache. For `dist run`,
    /// `--build` rebuilds and `--force-build` rebuilds without cache.
    pub fn build_options(&self) -> BuildOptions {
        match &self.command {
            DistCommand::Build(build) => BuildOptions {
                force_build: true,
                no_cache: build.no_cache,
            },
            DistCommand::Run(_) => BuildOptions {
                force_build: self.build || self.force_build,
                no_cache: self.force_build,
            },
        }
    }

    /// Registry of the subcommand, falling back to the `dist` option.
    pub fn registry(&self) -> Option<&str> {
        match &self.command {
            DistCommand::Build(BuildArgs {
                registry: Some(registry),
                ..
            }) => Some(registry.as_str()),
            _ => self.registry.as_deref(),
        }
    }

    pub fn health(&self) -> Result<HealthPolicy, CliError> {
        HealthPolicy::from_secs(
            self.health_timeout,
            self.health_retries,
            self.health_interval,
        )
        .map_err(|e| CliError::Usage(e.to_string()))
    }

    /// Resolve everything into orchestrator options for `context`.
    pub fn options(&self, context: PathBuf, image_tag: String) -> Result<DistOptions, CliError> {
        let project = context
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                CliError::Usage(format!(
                    "cannot derive a project name from {}",
                    context.display()
                ))
            })?;

        let mut settings = match &self.command {
            DistCommand::Run(run) => run.settings()?,
            DistCommand::Build(_) => RunSettings::default(),
        };
        // Replicas see the project directory as their working directory.
        if let Ok(relative) = Path::new(&settings.run_file).strip_prefix(&context) {
            settings.run_file = path_string(relative);
        }
        let relative_env = settings
            .environment_file
            .as_deref()
            .and_then(|env| Path::new(env).strip_prefix(&context).ok())
            .map(path_string);
        if relative_env.is_some() {
            settings.environment_file = relative_env;
        }

        Ok(DistOptions {
            project,
            context,
            run_id: self.id.clone(),
            image_tag,
            workers: self.workers,
            container_system: self.container_system,
            registry: self.registry().map(str::to_string),
            resources: ResourcePolicy {
                limit_nofile: self.limit_nofile,
                tty: self.tty,
            },
            health: self.health()?,
            build: self.build_options(),
            settings,
            worker_grace: Duration::from_secs(self.worker_grace),
            run_timeout: Duration::from_secs(self.run_timeout),
        })
    }

    /// `--yes` of the run subcommand.
    pub fn assume_yes(&self) -> bool {
        matches!(&self.command, DistCommand::Run(run) if run.yes)
    }
}

/// Parse `NAME=VALUE`.
pub fn parse_testdata(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err("-T/--testdata-variable needs to be in the format NAME=VALUE".to_string()),
    }
}

fn parse_container_system(value: &str) -> Result<ContainerSystem, String> {
    value.parse().map_err(|e: loadrun_core::CoreError| e.to_string())
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Warn about a low file descriptor limit and ask before going on.
///
/// `confirm` is only consulted when `assume_yes` is false.
pub async fn check_limit_nofile<F>(
    limit: u64,
    assume_yes: bool,
    confirm: impl FnOnce() -> F,
) -> Result<(), CliError>
where
    F: Future<Output = bool>,
{
    if limit >= RECOMMENDED_LIMIT_NOFILE {
        return Ok(());
    }

    eprintln!("!! this will cause warning messages from locust later on");
    if assume_yes || confirm().await {
        Ok(())
    } else {
        Err(CliError::Aborted)
    }
}

/// Ask a yes/no question without blocking the runtime.
pub async fn confirm(question: &'static str) -> bool {
    tokio::task::spawn_blocking(move || ask_yes_no(question))
        .await
        .unwrap_or(false)
}

/// Ask a yes/no question on the terminal. Blocks on stdin.
pub fn ask_yes_no(question: &str) -> bool {
    loop {
        eprint!("{} [y/n]: ", question);
        let _ = std::io::stderr().flush();

        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(0) | Err(_) => return false,
            Ok(_) => {}
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return true,
            "n" | "no" => return false,
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist(args: &[&str]) -> DistArgs {
        let mut argv = vec!["loadrun", "dist"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Dist(dist) => dist,
            other => panic!("expected dist, got {:?}", other),
        }
    }

    #[test]
    fn test_dist_defaults() {
        let args = dist(&["run", "test.feature"]);
        assert_eq!(args.workers, 1);
        assert_eq!(args.limit_nofile, 10001);
        assert_eq!(args.container_system, ContainerSystem::Docker);
        assert_eq!(args.health().unwrap(), HealthPolicy::default());
        assert_eq!(args.build_options(), BuildOptions::default());
        assert!(!args.assume_yes());
    }

    #[test]
    fn test_build_flag_mapping() {
        let opts = dist(&["build", "--no-cache"]).build_options();
        assert!(opts.force_build && opts.no_cache);

        let opts = dist(&["build"]).build_options();
        assert!(opts.force_build && !opts.no_cache);

        let opts = dist(&["--build", "run", "a.feature"]).build_options();
        assert!(opts.force_build && !opts.no_cache);

        let opts = dist(&["--force-build", "run", "a.feature"]).build_options();
        assert!(opts.force_build && opts.no_cache);

        assert!(Cli::try_parse_from([
            "loadrun",
            "dist",
            "--build",
            "--validate-config",
            "run",
            "a.feature"
        ])
        .is_err());
    }

    #[test]
    fn test_registry_precedence() {
        let args = dist(&["--registry", "ghcr.io/a", "build", "--registry", "ghcr.io/b"]);
        assert_eq!(args.registry(), Some("ghcr.io/b"));

        let args = dist(&["--registry", "ghcr.io/a", "build"]);
        assert_eq!(args.registry(), Some("ghcr.io/a"));
    }

    #[test]
    fn test_negative_workers_parse() {
        let args = dist(&["--workers", "-1", "build"]);
        assert_eq!(args.workers, -1);
    }

    #[test]
    fn test_container_system_option() {
        let args = dist(&["--container-system", "podman", "build"]);
        assert_eq!(args.container_system, ContainerSystem::Podman);
        assert!(Cli::try_parse_from(["loadrun", "dist", "--container-system", "lxc", "build"]).is_err());
    }

    #[test]
    fn test_testdata_variables() {
        assert_eq!(
            parse_testdata("key=value").unwrap(),
            ("key".to_string(), "value".to_string())
        );
        assert_eq!(
            parse_testdata("url=http://x?a=b").unwrap(),
            ("url".to_string(), "http://x?a=b".to_string())
        );
        let err = parse_testdata("key").unwrap_err();
        assert_eq!(err, "-T/--testdata-variable needs to be in the format NAME=VALUE");
        assert!(parse_testdata("=value").is_err());

        let cli = Cli::try_parse_from([
            "loadrun", "local", "run", "a.feature", "-T", "a=1", "-T", "b=2",
        ])
        .unwrap();
        let Command::Local {
            command: LocalCommand::Run(run),
        } = cli.command
        else {
            panic!("expected local run");
        };
        assert_eq!(run.testdata.len(), 2);

        assert!(Cli::try_parse_from(["loadrun", "local", "run", "a.feature", "-T", "bad"]).is_err());
    }

    #[test]
    fn test_options_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_path_buf();
        let feature = dir.join("test.feature");
        std::fs::write(&feature, "Feature: x\n").unwrap();

        let feature_arg = feature.to_string_lossy().into_owned();
        let args = dist(&[
            "--workers",
            "4",
            "--registry",
            "registry.local:5000",
            "--limit-nofile",
            "20000",
            "run",
            &feature_arg,
            "-T",
            "user=alice",
        ]);
        let options = args.options(dir.clone(), "alice".to_string()).unwrap();

        assert_eq!(options.workers, 4);
        assert_eq!(options.resources.limit_nofile, 20000);
        assert_eq!(options.settings.testdata["user"], "alice");
        assert_eq!(options.settings.run_file, "test.feature");

        let spec = options.topology().unwrap();
        assert_eq!(spec.registry(), Some("registry.local:5000/"));
        assert_eq!(spec.worker_count(), 4);
    }

    #[test]
    fn test_missing_feature_file_is_usage_error() {
        let args = dist(&["run", "/nonexistent/test.feature"]);
        let err = args
            .options(PathBuf::from("/tmp/project"), "alice".to_string())
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    fn not_asked() -> std::future::Ready<bool> {
        panic!("not asked")
    }

    #[tokio::test]
    async fn test_limit_nofile_confirmation() {
        assert!(check_limit_nofile(10001, false, not_asked).await.is_ok());
        assert!(check_limit_nofile(1024, true, not_asked).await.is_ok());
        assert!(check_limit_nofile(1024, false, || async { true }).await.is_ok());
        assert!(matches!(
            check_limit_nofile(1024, false, || async { false }).await,
            Err(CliError::Aborted)
        ));
    }

    #[test]
    fn test_run_timeout_flag() {
        let args = dist(&["--run-timeout", "90", "build"]);
        assert_eq!(args.run_timeout, 90);
        assert_eq!(dist(&["build"]).run_timeout, DEFAULT_RUN_TIMEOUT.as_secs());
    }
}
