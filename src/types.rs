//! Data structures shared by the update cycle.
//!
//! Containers and images are described with plain owned types rather
//! than the Docker API models so that every stage of the cycle can be
//! driven by any [`ContainerRuntime`](crate::runtime::ContainerRuntime)
//! implementation.  Reports are serialised with
//! [`serde`](https://serde.rs/) for the raw JSON webhook format.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// A host port a container port is published on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

/// A structured mount as reported by `HostConfig.Mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub target: String,
    pub source: String,
    /// `bind`, `volume`, `tmpfs`, ...
    pub kind: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub name: String,
    pub maximum_retry_count: i64,
}

/// Effective runtime configuration of a container, as introspected.
///
/// Empty collections and `None` mean "not set on the original container";
/// recreation only copies values that are present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeConfig {
    /// The image reference the container was created from (`Config.Image`).
    pub image: String,
    /// Internal hostname (`Config.Hostname`).
    pub hostname: Option<String>,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub labels: HashMap<String, String>,
    pub port_bindings: HashMap<String, Vec<PortBinding>>,
    /// Legacy `host:container[:mode]` bind strings.
    pub binds: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub network_mode: Option<String>,
    pub restart_policy: Option<RestartPolicy>,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub memory: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub cpu_quota: Option<i64>,
}

/// A running container.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub id: String,
    pub name: String,
    /// Local id of the image the container runs (`sha256:...`).
    pub image_id: String,
    pub config: RuntimeConfig,
}

impl Container {
    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.config.labels
    }
}

/// What the runtime knows about a locally present image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageDetails {
    pub id: String,
    pub repo_tags: Vec<String>,
    /// `repository@sha256:...` entries recorded when the image was pulled.
    pub repo_digests: Vec<String>,
}

impl ImageDetails {
    /// The digest the update detector compares: the first repo digest, or
    /// the local image id when the image has no pull provenance.
    pub fn current_digest(&self) -> Option<String> {
        self.repo_digests
            .first()
            .cloned()
            .or_else(|| Some(self.id.clone()).filter(|id| !id.is_empty()))
    }
}

/// Result of a prune call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub images_deleted: u64,
    pub space_reclaimed: u64,
}

/// Why a container was not checked against its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The container runs from an untagged image id.
    Untagged,
    /// The classifier decided the image was built locally.
    LocalOnly,
    /// The pull reported that no registry knows the reference.
    NotInRegistry,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::Untagged => "no tagged image",
            SkipReason::LocalOnly => "local-only image",
            SkipReason::NotInRegistry => "not found in registry",
        };
        f.write_str(text)
    }
}

/// Outcome of checking one container for a newer image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    UpdateAvailable,
    UpToDate,
    Skipped(SkipReason),
    Error(String),
}

/// Category of a container entry in the cycle report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerStatus {
    Updated,
    UpToDate,
    Skipped,
    Error,
    PendingRestart,
}

impl ContainerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerStatus::Updated => "updated",
            ContainerStatus::UpToDate => "up-to-date",
            ContainerStatus::Skipped => "skipped",
            ContainerStatus::Error => "error",
            ContainerStatus::PendingRestart => "pending-restart",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerReport {
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub message: String,
}

impl ContainerReport {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        status: ContainerStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            status,
            message: message.into(),
        }
    }
}

/// Aggregated result of one update cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub timestamp: String,
    pub hostname: String,
    pub duration_seconds: f64,
    pub containers_checked: u32,
    pub containers_updated: u32,
    pub containers_skipped: u32,
    pub containers_failed: u32,
    pub images_cleaned: u64,
    pub space_reclaimed_mb: f64,
    pub container_reports: Vec<ContainerReport>,
    pub errors: Vec<String>,
}

impl CycleReport {
    pub fn new(timestamp: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            hostname: hostname.into(),
            duration_seconds: 0.0,
            containers_checked: 0,
            containers_updated: 0,
            containers_skipped: 0,
            containers_failed: 0,
            images_cleaned: 0,
            space_reclaimed_mb: 0.0,
            container_reports: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_status(&self, status: ContainerStatus) -> impl Iterator<Item = &ContainerReport> {
        self.container_reports
            .iter()
            .filter(move |c| c.status == status)
    }

    pub fn has_errors(&self) -> bool {
        self.containers_failed > 0 || !self.errors.is_empty()
    }
}
