//! Command-line dialects of the supported engines.
//!
//! Docker and Podman share most of their CLI. The differences that matter here
//! are how an image's existence is checked, that Podman needs `--format docker`
//! to keep `HEALTHCHECK` instructions, and how health is exposed by `inspect`.

use loadrun_core::{ContainerSystem, RoleStatus};

use crate::backend::{BuildRequest, ContainerSpec, MountKind};

/// Argument builders for one engine.
pub trait Dialect: Send + Sync + 'static {
    /// Engine this dialect speaks.
    fn system(&self) -> ContainerSystem;

    /// Executable name.
    fn program(&self) -> &'static str {
        self.system().program()
    }

    /// Arguments checking whether an image exists (exit 0 = exists).
    fn image_exists_args(&self, image: &str) -> Vec<String>;

    /// Engine-specific flags prepended to every build.
    fn extra_build_flags(&self) -> &'static [&'static str] {
        &[]
    }

    /// `inspect` template producing `<status> <exit code> [<health>]`.
    fn health_format(&self) -> &'static str;

    /// Arguments for an image build.
    fn build_args(&self, request: &BuildRequest) -> Vec<String> {
        let mut args = vec!["image".to_string(), "build".to_string()];
        args.extend(self.extra_build_flags().iter().map(|s| s.to_string()));
        args.push("--file".to_string());
        args.push(request.containerfile.display().to_string());
        for tag in &request.tags {
            args.push("--tag".to_string());
            args.push(tag.clone());
        }
        for (key, value) in &request.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        if request.no_cache {
            args.push("--no-cache".to_string());
        }
        args.push(request.context.display().to_string());
        args
    }

    /// Arguments starting one detached container.
    fn run_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--hostname".to_string(),
            spec.name.clone(),
        ];

        if !spec.network.is_empty() {
            args.push("--network".to_string());
            args.push(spec.network.clone());
        }

        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        if spec.limit_nofile > 0 {
            args.push("--ulimit".to_string());
            args.push(format!("nofile={0}:{0}", spec.limit_nofile));
        }

        if spec.tty {
            args.push("--tty".to_string());
        }

        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        for mount in &spec.mounts {
            let kind = match mount.kind {
                MountKind::Bind => "bind",
                MountKind::Volume => "volume",
            };
            let mut value = format!("type={},source={},target={}", kind, mount.source, mount.target);
            if mount.read_only {
                value.push_str(",readonly");
            }
            args.push("--mount".to_string());
            args.push(value);
        }

        if let Some(workdir) = &spec.workdir {
            args.push("--workdir".to_string());
            args.push(workdir.clone());
        }

        if let Some(health) = &spec.health {
            args.push("--health-interval".to_string());
            args.push(format!("{}s", health.interval.as_secs().max(1)));
            args.push("--health-timeout".to_string());
            args.push(format!("{}s", health.timeout.as_secs().max(1)));
            args.push("--health-retries".to_string());
            args.push(health.retries.max(1).to_string());
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

/// The Docker CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct Docker;

impl Dialect for Docker {
    fn system(&self) -> ContainerSystem {
        ContainerSystem::Docker
    }

    fn image_exists_args(&self, image: &str) -> Vec<String> {
        vec![
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            image.to_string(),
        ]
    }

    fn health_format(&self) -> &'static str {
        HEALTH_FORMAT
    }
}

/// The Podman CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct Podman;

impl Dialect for Podman {
    fn system(&self) -> ContainerSystem {
        ContainerSystem::Podman
    }

    fn image_exists_args(&self, image: &str) -> Vec<String> {
        vec!["image".to_string(), "exists".to_string(), image.to_string()]
    }

    fn extra_build_flags(&self) -> &'static [&'static str] {
        &["--format", "docker"]
    }

    fn health_format(&self) -> &'static str {
        HEALTH_FORMAT
    }
}

/// `inspect` template shared by both engines. Images without a HEALTHCHECK
/// have no health block; dereferencing it would fail the whole template.
const HEALTH_FORMAT: &str =
    "{{.State.Status}} {{.State.ExitCode}} {{if .State.Health}}{{.State.Health.Status}}{{else}}none{{end}}";

/// Interpret the output of the health `inspect` template.
pub fn parse_health(output: &str) -> Result<RoleStatus, String> {
    let mut tokens = output.split_whitespace();
    let state = tokens.next().ok_or_else(|| "empty output".to_string())?;
    let code: i32 = tokens
        .next()
        .ok_or_else(|| format!("missing exit code in '{}'", output.trim()))?
        .parse()
        .map_err(|_| format!("invalid exit code in '{}'", output.trim()))?;
    let health = tokens.next().unwrap_or("none");

    match state {
        "exited" | "dead" | "stopped" | "removing" => Ok(RoleStatus::Exited(code)),
        "created" | "restarting" | "paused" | "configured" | "initialized" => {
            Ok(RoleStatus::Starting)
        }
        "running" => match health {
            "healthy" | "none" | "" | "<no" => Ok(RoleStatus::Healthy),
            "starting" => Ok(RoleStatus::Starting),
            "unhealthy" => Ok(RoleStatus::Unhealthy),
            other => Err(format!("unknown health status '{}'", other)),
        },
        other => Err(format!("unknown container state '{}'", other)),
    }
}
