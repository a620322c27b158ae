use std::time::Duration;

use async_trait::async_trait;

use crate::recreate::CreateRequest;
use crate::types::{Container, ImageDetails, PruneStats};

pub mod docker;
#[cfg(test)]
pub mod mock;

pub use docker::DockerRuntime;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The container or image does not exist locally.
    #[error("not found: {0}")]
    NotFound(String),

    /// A pull failed because no registry knows the repository or tag.
    #[error("not found in any registry: {0}")]
    NotInRegistry(String),

    #[error("Docker API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("{0}")]
    Other(String),
}

/// The container runtime operations the update cycle relies on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List running containers with their full configuration.
    async fn list_running(&self) -> Result<Vec<Container>, RuntimeError>;

    /// Inspect a single container by id or name.
    async fn inspect_container(&self, id_or_name: &str) -> Result<Container, RuntimeError>;

    /// Inspect a local image. `Ok(None)` when it is not present.
    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageDetails>, RuntimeError>;

    /// Pull `repository:tag`, returning [`RuntimeError::NotInRegistry`] when
    /// the reference is unknown to every registry.
    async fn pull_image(&self, repository: &str, tag: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Create and start a container, returning the new container id.
    async fn create_and_start(&self, request: &CreateRequest) -> Result<String, RuntimeError>;

    /// Remove unused images. With `dangling_only` only untagged layers go.
    async fn prune_images(&self, dangling_only: bool) -> Result<PruneStats, RuntimeError>;
}
