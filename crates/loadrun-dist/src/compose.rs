//! Compose rendering of a topology, used by `--validate-config`.
//!
//! The document is rendered from the same [`ContainerSpec`]s the launcher
//! starts, so what is validated is what would run.

use std::collections::BTreeMap;

use loadrun_backend::{ContainerSpec, MountKind};
use loadrun_core::{ClusterSpec, HealthPolicy, RoleKind};
use serde::Serialize;

use crate::launcher::{container_spec, run_labels};

/// Top-level compose document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposeDocument {
    pub name: String,
    pub services: BTreeMap<String, Service>,
    pub networks: BTreeMap<String, Resource>,
    pub volumes: BTreeMap<String, Resource>,
}

/// One replica.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Service {
    pub image: String,
    pub container_name: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub networks: Vec<String>,
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub ulimits: Ulimits,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub tty: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ulimits {
    pub nofile: Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Limit {
    pub soft: u64,
    pub hard: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Healthcheck {
    pub interval: String,
    pub timeout: String,
    pub retries: u32,
}

/// Named network or volume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl ComposeDocument {
    /// Render the cluster as it would be launched.
    pub fn render(spec: &ClusterSpec, health: &HealthPolicy) -> Self {
        let labels = run_labels(spec);
        let coordinator = spec.coordinator_name();

        let services = spec
            .replicas()
            .into_iter()
            .map(|(kind, _, name)| {
                let mut service = Service::from(container_spec(spec, kind, &name, health));
                if kind == RoleKind::Worker {
                    service.depends_on.push(coordinator.clone());
                }
                (name, service)
            })
            .collect();

        let resource = |name: &str| {
            (
                name.to_string(),
                Resource {
                    name: name.to_string(),
                    labels: labels.clone(),
                },
            )
        };

        Self {
            name: spec.prefix().to_string(),
            services,
            networks: [resource(spec.network())].into_iter().collect(),
            volumes: spec.volumes().iter().map(|v| resource(v)).collect(),
        }
    }

    /// Pretty JSON; compose reads JSON as YAML.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl From<ContainerSpec> for Service {
    fn from(container: ContainerSpec) -> Self {
        let volumes = container
            .mounts
            .iter()
            .map(|m| {
                let mut entry = format!("{}:{}", m.source, m.target);
                if m.read_only {
                    entry.push_str(":ro");
                } else if m.kind == MountKind::Bind {
                    entry.push_str(":rw");
                }
                entry
            })
            .collect();

        Self {
            image: container.image,
            hostname: container.name.clone(),
            container_name: container.name,
            command: container.command,
            environment: container.env,
            labels: container.labels,
            networks: vec![container.network],
            volumes,
            working_dir: container.workdir,
            ulimits: Ulimits {
                nofile: Limit {
                    soft: container.limit_nofile,
                    hard: container.limit_nofile,
                },
            },
            tty: container.tty,
            healthcheck: container.health.map(|h| Healthcheck {
                interval: format!("{}s", h.interval.as_secs()),
                timeout: format!("{}s", h.timeout.as_secs()),
                retries: h.retries,
            }),
            depends_on: Vec::new(),
        }
    }
}
