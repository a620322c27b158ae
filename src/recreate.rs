//! Container recreation.
//!
//! A container is replaced by stopping and removing it, then creating a
//! new one under the same name from a [`CreateRequest`] built out of the
//! old container's introspected configuration.  The swap is not atomic:
//! between removal and creation nothing with that name is running.

use std::collections::HashMap;
use std::time::Duration;

use log::{error, info};

use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::types::{Container, MountSpec, PortBinding, RestartPolicy, RuntimeConfig};

/// Grace period given to the old container before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(30);

/// Everything needed to create the replacement container.
///
/// `None` means the field is left to the runtime's default, exactly as it
/// was on the original container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateRequest {
    pub name: String,
    pub image: String,
    pub env: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub labels: Option<HashMap<String, String>>,
    pub port_bindings: Option<HashMap<String, Vec<PortBinding>>>,
    pub binds: Option<Vec<String>>,
    pub mounts: Option<Vec<MountSpec>>,
    pub network_mode: Option<String>,
    pub restart_policy: Option<RestartPolicy>,
    pub privileged: Option<bool>,
    pub cap_add: Option<Vec<String>>,
    pub cap_drop: Option<Vec<String>>,
    pub memory: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub cpu_quota: Option<i64>,
}

impl CreateRequest {
    pub fn builder(name: impl Into<String>, image: impl Into<String>) -> CreateRequestBuilder {
        CreateRequestBuilder {
            request: CreateRequest {
                name: name.into(),
                image: image.into(),
                ..Default::default()
            },
        }
    }

    /// Build the request that reproduces `config` under `name`.
    pub fn from_snapshot(name: &str, config: &RuntimeConfig) -> Self {
        Self::builder(name, config.image.as_str())
            .env(&config.env)
            .cmd(&config.cmd)
            .entrypoint(&config.entrypoint)
            .working_dir(config.working_dir.as_deref())
            .user(config.user.as_deref())
            .labels(&config.labels)
            .port_bindings(&config.port_bindings)
            .binds(&config.binds)
            .mounts(&config.mounts)
            .network_mode(config.network_mode.as_deref())
            .restart_policy(config.restart_policy.as_ref())
            .privileged(config.privileged)
            .cap_add(&config.cap_add)
            .cap_drop(&config.cap_drop)
            .memory(config.memory)
            .nano_cpus(config.nano_cpus)
            .cpu_quota(config.cpu_quota)
            .build()
    }
}

/// Copies a source value into the request only when it is non-empty.
#[derive(Debug)]
pub struct CreateRequestBuilder {
    request: CreateRequest,
}

fn non_empty_vec<T: Clone>(values: &[T]) -> Option<Vec<T>> {
    (!values.is_empty()).then(|| values.to_vec())
}

fn non_empty_str(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

fn non_zero(value: Option<i64>) -> Option<i64> {
    value.filter(|v| *v != 0)
}

impl CreateRequestBuilder {
    pub fn env(mut self, env: &[String]) -> Self {
        self.request.env = non_empty_vec(env);
        self
    }

    pub fn cmd(mut self, cmd: &[String]) -> Self {
        self.request.cmd = non_empty_vec(cmd);
        self
    }

    pub fn entrypoint(mut self, entrypoint: &[String]) -> Self {
        self.request.entrypoint = non_empty_vec(entrypoint);
        self
    }

    pub fn working_dir(mut self, dir: Option<&str>) -> Self {
        self.request.working_dir = non_empty_str(dir);
        self
    }

    pub fn user(mut self, user: Option<&str>) -> Self {
        self.request.user = non_empty_str(user);
        self
    }

    pub fn labels(mut self, labels: &HashMap<String, String>) -> Self {
        self.request.labels = (!labels.is_empty()).then(|| labels.clone());
        self
    }

    pub fn port_bindings(mut self, bindings: &HashMap<String, Vec<PortBinding>>) -> Self {
        self.request.port_bindings = (!bindings.is_empty()).then(|| bindings.clone());
        self
    }

    /// Only well-formed `source:target[:mode]` strings are carried over.
    pub fn binds(mut self, binds: &[String]) -> Self {
        let valid: Vec<String> = binds
            .iter()
            .filter(|b| b.split(':').count() >= 2)
            .cloned()
            .collect();
        self.request.binds = non_empty_vec(&valid);
        self
    }

    pub fn mounts(mut self, mounts: &[MountSpec]) -> Self {
        self.request.mounts = non_empty_vec(mounts);
        self
    }

    pub fn network_mode(mut self, mode: Option<&str>) -> Self {
        self.request.network_mode = non_empty_str(mode);
        self
    }

    pub fn restart_policy(mut self, policy: Option<&RestartPolicy>) -> Self {
        self.request.restart_policy = policy.cloned().map(|p| RestartPolicy {
            name: if p.name.is_empty() { "no".into() } else { p.name },
            maximum_retry_count: p.maximum_retry_count,
        });
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.request.privileged = privileged.then_some(true);
        self
    }

    pub fn cap_add(mut self, caps: &[String]) -> Self {
        self.request.cap_add = non_empty_vec(caps);
        self
    }

    pub fn cap_drop(mut self, caps: &[String]) -> Self {
        self.request.cap_drop = non_empty_vec(caps);
        self
    }

    pub fn memory(mut self, bytes: Option<i64>) -> Self {
        self.request.memory = non_zero(bytes);
        self
    }

    pub fn nano_cpus(mut self, nano_cpus: Option<i64>) -> Self {
        self.request.nano_cpus = non_zero(nano_cpus);
        self
    }

    pub fn cpu_quota(mut self, quota: Option<i64>) -> Self {
        self.request.cpu_quota = non_zero(quota);
        self
    }

    pub fn build(self) -> CreateRequest {
        self.request
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {source}")]
pub struct RecreateError {
    stage: &'static str,
    #[source]
    source: RuntimeError,
}

fn at(stage: &'static str) -> impl FnOnce(RuntimeError) -> RecreateError {
    move |source| RecreateError { stage, source }
}

/// Image reference for the replacement. A container started from a bare
/// image id is moved onto the tag that was pulled for it.
fn replacement_image<'a>(configured: &'a str, pulled: Option<&'a str>) -> &'a str {
    match pulled {
        Some(pulled) if configured.is_empty() || configured.starts_with("sha256:") => pulled,
        _ => configured,
    }
}

/// Replace `container` with a fresh one running the same image reference,
/// or `pulled` when the container was created from an image id.
///
/// Returns the id of the new container.  On failure the old container may
/// already be stopped or removed; nothing is rolled back.
pub async fn try_recreate(
    runtime: &dyn ContainerRuntime,
    container: &Container,
    pulled: Option<&str>,
) -> Result<String, RecreateError> {
    info!("Recreating container: {}", container.name);
    let mut request = CreateRequest::from_snapshot(&container.name, &container.config);
    request.image = replacement_image(&container.config.image, pulled).to_string();

    info!("Stopping container: {}", container.name);
    runtime
        .stop_container(&container.id, STOP_GRACE)
        .await
        .map_err(at("stop"))?;

    info!("Removing old container: {}", container.name);
    runtime
        .remove_container(&container.id)
        .await
        .map_err(at("remove"))?;

    info!("Creating new container: {}", container.name);
    let new_id = runtime
        .create_and_start(&request)
        .await
        .map_err(at("create"))?;

    info!("Successfully recreated container: {}", container.name);
    Ok(new_id)
}

/// [`try_recreate`] with the failure logged and flattened to `false`.
pub async fn recreate(
    runtime: &dyn ContainerRuntime,
    container: &Container,
    pulled: Option<&str>,
) -> bool {
    match try_recreate(runtime, container, pulled).await {
        Ok(_) => true,
        Err(e) => {
            error!("Failed to recreate container {}: {}", container.name, e);
            false
        }
    }
}
