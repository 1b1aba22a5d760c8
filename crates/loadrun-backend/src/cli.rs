//! Backend driving an engine through its command-line interface.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use loadrun_core::{ClusterSpec, ContainerSystem, RoleStatus};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{BuildRequest, ContainerBackend, ContainerId, ContainerSpec};
use crate::dialect::{parse_health, Dialect, Docker, Podman};
use crate::error::BackendError;

/// Captured result of one engine command.
#[derive(Debug, Clone)]
struct CommandOutput {
    code: i32,
    stdout: String,
    stderr: String,
}

/// Container backend speaking a [`Dialect`] over the engine CLI.
///
/// Every spawned process is killed when its future is dropped, so cancelling a
/// phase never leaves `logs --follow` or `wait` processes behind.
#[derive(Debug, Clone)]
pub struct CliBackend<D: Dialect> {
    dialect: D,
    program: String,
}

/// Docker-backed [`CliBackend`].
pub type DockerBackend = CliBackend<Docker>;

/// Podman-backed [`CliBackend`].
pub type PodmanBackend = CliBackend<Podman>;

impl<D: Dialect> CliBackend<D> {
    /// Create a backend using the dialect's default executable.
    pub fn new(dialect: D) -> Self {
        let program = dialect.program().to_string();
        Self { dialect, program }
    }

    /// Override the executable path.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.program, args.join(" "))
    }

    fn spawn_error(&self, source: std::io::Error) -> BackendError {
        if source.kind() == std::io::ErrorKind::NotFound {
            BackendError::NotInstalled(self.program.clone())
        } else {
            BackendError::Spawn {
                program: self.program.clone(),
                source,
            }
        }
    }

    /// Run to completion capturing stdout/stderr.
    async fn output(&self, args: &[String]) -> Result<CommandOutput, BackendError> {
        debug!(command = %self.describe(args), "Running engine command");
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run to completion and fail on a non-zero exit.
    async fn checked(&self, args: &[String]) -> Result<String, BackendError> {
        let output = self.output(args).await?;
        if output.code != 0 {
            return Err(BackendError::CommandFailed {
                command: self.describe(args),
                code: output.code,
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    /// Run to completion with stdout/stderr inherited; returns the exit code.
    async fn status(&self, args: &[String]) -> Result<i32, BackendError> {
        info!(command = %self.describe(args), "Running engine command");
        let status = self
            .command(args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| self.spawn_error(e))?;
        Ok(status.code().unwrap_or(-1))
    }

    /// List ids of `kind` (`container`, `network`, `volume`) carrying the run label.
    async fn labelled(&self, kind: &str, spec: &ClusterSpec) -> Result<Vec<String>, BackendError> {
        let (key, value) = spec.label();
        let mut args = vec![kind.to_string(), "ls".to_string(), "--quiet".to_string()];
        if kind == "container" {
            args.push("--all".to_string());
        }
        args.push("--filter".to_string());
        args.push(format!("label={}={}", key, value));

        let stdout = self.checked(&args).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn remove_labelled(
        &self,
        kind: &str,
        spec: &ClusterSpec,
        remove: &[&str],
    ) -> Result<usize, BackendError> {
        let ids = self.labelled(kind, spec).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let mut args: Vec<String> = remove.iter().map(|s| s.to_string()).collect();
        args.extend(ids.iter().cloned());
        self.checked(&args).await?;
        Ok(ids.len())
    }
}

fn label_args(labels: &BTreeMap<String, String>) -> Vec<String> {
    labels
        .iter()
        .flat_map(|(k, v)| ["--label".to_string(), format!("{}={}", k, v)])
        .collect()
}

/// Forward every line of `reader` to `sink`; stops early if `sink` closes.
async fn forward_lines<R>(reader: R, sink: mpsc::Sender<String>) -> Result<(), BackendError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if sink.send(line).await.is_err() {
            break;
        }
    }
    Ok(())
}

#[async_trait]
impl<D: Dialect> ContainerBackend for CliBackend<D> {
    fn system(&self) -> ContainerSystem {
        self.dialect.system()
    }

    async fn image_exists(&self, image: &str) -> Result<bool, BackendError> {
        let output = self.output(&self.dialect.image_exists_args(image)).await?;
        Ok(output.code == 0)
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<i32, BackendError> {
        self.status(&self.dialect.build_args(request)).await
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<i32, BackendError> {
        let args = vec![
            "image".to_string(),
            "tag".to_string(),
            source.to_string(),
            target.to_string(),
        ];
        self.status(&args).await
    }

    async fn push_image(&self, image: &str) -> Result<i32, BackendError> {
        let args = vec!["image".to_string(), "push".to_string(), image.to_string()];
        self.status(&args).await
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        let mut args = vec!["network".to_string(), "create".to_string()];
        args.extend(label_args(labels));
        args.push(name.to_string());
        self.checked(&args).await?;
        info!(network = %name, "Created network");
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        let mut args = vec!["volume".to_string(), "create".to_string()];
        args.extend(label_args(labels));
        args.push(name.to_string());
        self.checked(&args).await?;
        info!(volume = %name, "Created volume");
        Ok(())
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerId, BackendError> {
        let args = self.dialect.run_args(spec);
        let stdout = self.checked(&args).await?;
        let id = stdout.lines().last().map(str::trim).unwrap_or_default();
        if id.is_empty() {
            return Err(BackendError::UnexpectedOutput {
                command: self.describe(&args),
                output: stdout,
            });
        }
        Ok(ContainerId::new(id))
    }

    async fn poll_health(&self, container: &ContainerId) -> Result<RoleStatus, BackendError> {
        let args = vec![
            "container".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            self.dialect.health_format().to_string(),
            container.as_str().to_string(),
        ];
        let stdout = self.checked(&args).await?;
        parse_health(&stdout).map_err(|reason| BackendError::UnexpectedOutput {
            command: self.describe(&args),
            output: reason,
        })
    }

    async fn stream_logs(
        &self,
        container: &ContainerId,
        sink: mpsc::Sender<String>,
    ) -> Result<(), BackendError> {
        let args = vec![
            "logs".to_string(),
            "--follow".to_string(),
            container.as_str().to_string(),
        ];
        let mut child = self
            .command(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child.stdout.take().ok_or_else(|| BackendError::UnexpectedOutput {
            command: self.describe(&args),
            output: "stdout not captured".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| BackendError::UnexpectedOutput {
            command: self.describe(&args),
            output: "stderr not captured".to_string(),
        })?;

        let (out, err) = tokio::join!(
            forward_lines(stdout, sink.clone()),
            forward_lines(stderr, sink)
        );
        out?;
        err?;

        let status = child.wait().await?;
        if !status.success() {
            warn!(
                container = %container,
                code = status.code().unwrap_or(-1),
                "Log stream ended with error"
            );
        }
        Ok(())
    }

    async fn await_exit(&self, container: &ContainerId) -> Result<i32, BackendError> {
        let args = vec!["wait".to_string(), container.as_str().to_string()];
        let stdout = self.checked(&args).await?;
        stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .and_then(|l| l.parse::<i32>().ok())
            .ok_or_else(|| BackendError::UnexpectedOutput {
                command: self.describe(&args),
                output: stdout.clone(),
            })
    }

    async fn remove_resources(&self, spec: &ClusterSpec) -> Result<(), BackendError> {
        // Containers first: networks and volumes in use cannot be removed.
        // Every kind is attempted even if an earlier one failed.
        let steps: [(&str, &[&str]); 3] = [
            ("container", &["rm", "--force", "--volumes"]),
            ("network", &["network", "rm"]),
            ("volume", &["volume", "rm", "--force"]),
        ];

        let mut removed = [0usize; 3];
        let mut errors = Vec::new();
        for (slot, (kind, remove)) in removed.iter_mut().zip(steps) {
            match self.remove_labelled(kind, spec, remove).await {
                Ok(count) => *slot = count,
                Err(e) => {
                    warn!(prefix = %spec.prefix(), kind, error = %e, "Failed to remove resources");
                    errors.push(e);
                }
            }
        }

        info!(
            prefix = %spec.prefix(),
            containers = removed[0],
            networks = removed[1],
            volumes = removed[2],
            "Removed cluster resources"
        );
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BackendError::Cleanup(errors))
        }
    }
}

/// Construct the backend for the selected container system.
pub fn backend_for(system: ContainerSystem) -> Arc<dyn ContainerBackend> {
    match system {
        ContainerSystem::Docker => Arc::new(DockerBackend::new(Docker)),
        ContainerSystem::Podman => Arc::new(PodmanBackend::new(Podman)),
    }
}

/// Check that the engine executable can be run.
pub async fn probe(system: ContainerSystem) -> Result<String, BackendError> {
    let program = system.program();
    let output = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::NotInstalled(program.to_string())
            } else {
                BackendError::Spawn {
                    program: program.to_string(),
                    source: e,
                }
            }
        })?;

    if !output.status.success() {
        return Err(BackendError::CommandFailed {
            command: format!("{} --version", program),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
