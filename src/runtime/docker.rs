use super::{ContainerRuntime, RuntimeError};
use crate::recreate::CreateRequest;
use crate::types::{
    Container, ImageDetails, MountSpec, PortBinding, PruneStats, RestartPolicy, RuntimeConfig,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{CreateImageOptions, PruneImagesOptions};
use bollard::models::{
    ContainerInspectResponse, HostConfig, Mount, MountTypeEnum, RestartPolicyNameEnum,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info};
use std::collections::HashMap;
use std::time::Duration;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and make sure it answers.
    pub async fn connect() -> anyhow::Result<Self> {
        // Honours DOCKER_HOST, otherwise the unix socket on Linux.
        let docker = Docker::connect_with_local_defaults()?;
        let version = docker.version().await?;
        info!(
            "Connected to Docker {} (API {})",
            version.version.unwrap_or_default(),
            version.api_version.unwrap_or_default()
        );
        Ok(Self { docker })
    }
}

fn status_code(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn not_found_or(what: &str, err: DockerError) -> RuntimeError {
    if status_code(&err) == Some(404) {
        RuntimeError::NotFound(what.to_string())
    } else {
        RuntimeError::Api(err)
    }
}

/// Whether a pull error says no registry has the reference.
fn is_registry_absence(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("repository does not exist")
        || message.contains("pull access denied")
        || message.contains("not found")
}

fn pull_error(reference: &str, err: DockerError) -> RuntimeError {
    let message = match &err {
        DockerError::DockerResponseServerError { message, .. } => message.clone(),
        DockerError::DockerStreamError { error } => error.clone(),
        other => other.to_string(),
    };
    if is_registry_absence(&message) {
        RuntimeError::NotInRegistry(format!("{}: {}", reference, message))
    } else {
        RuntimeError::Api(err)
    }
}

fn restart_name_to_str(name: RestartPolicyNameEnum) -> &'static str {
    match name {
        RestartPolicyNameEnum::NO => "no",
        RestartPolicyNameEnum::ALWAYS => "always",
        RestartPolicyNameEnum::UNLESS_STOPPED => "unless-stopped",
        RestartPolicyNameEnum::ON_FAILURE => "on-failure",
        _ => "",
    }
}

fn restart_name_from_str(name: &str) -> RestartPolicyNameEnum {
    match name {
        "no" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::EMPTY,
    }
}

fn mount_kind_to_str(kind: MountTypeEnum) -> &'static str {
    match kind {
        MountTypeEnum::BIND => "bind",
        MountTypeEnum::VOLUME => "volume",
        MountTypeEnum::TMPFS => "tmpfs",
        MountTypeEnum::NPIPE => "npipe",
        MountTypeEnum::CLUSTER => "cluster",
        _ => "",
    }
}

fn mount_kind_from_str(kind: &str) -> MountTypeEnum {
    match kind {
        "bind" => MountTypeEnum::BIND,
        "volume" => MountTypeEnum::VOLUME,
        "tmpfs" => MountTypeEnum::TMPFS,
        "npipe" => MountTypeEnum::NPIPE,
        "cluster" => MountTypeEnum::CLUSTER,
        _ => MountTypeEnum::EMPTY,
    }
}

fn container_from_inspect(detail: ContainerInspectResponse) -> Container {
    let config = detail.config.unwrap_or_default();
    let host = detail.host_config.unwrap_or_default();

    let port_bindings = host
        .port_bindings
        .unwrap_or_default()
        .into_iter()
        .map(|(port, bindings)| {
            let bindings = bindings
                .unwrap_or_default()
                .into_iter()
                .map(|b| PortBinding {
                    host_ip: b.host_ip,
                    host_port: b.host_port,
                })
                .collect();
            (port, bindings)
        })
        .collect();

    let mounts = host
        .mounts
        .unwrap_or_default()
        .into_iter()
        .map(|m| MountSpec {
            target: m.target.unwrap_or_default(),
            source: m.source.unwrap_or_default(),
            kind: m.typ.map(mount_kind_to_str).unwrap_or_default().to_string(),
            read_only: m.read_only.unwrap_or(false),
        })
        .collect();

    let restart_policy = host.restart_policy.map(|p| RestartPolicy {
        name: p.name.map(restart_name_to_str).unwrap_or_default().to_string(),
        maximum_retry_count: p.maximum_retry_count.unwrap_or(0),
    });

    Container {
        id: detail.id.unwrap_or_default(),
        name: detail
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        image_id: detail.image.unwrap_or_default(),
        config: RuntimeConfig {
            image: config.image.unwrap_or_default(),
            hostname: config.hostname,
            env: config.env.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
            entrypoint: config.entrypoint.unwrap_or_default(),
            working_dir: config.working_dir,
            user: config.user,
            labels: config.labels.unwrap_or_default(),
            port_bindings,
            binds: host.binds.unwrap_or_default(),
            mounts,
            network_mode: host.network_mode,
            restart_policy,
            privileged: host.privileged.unwrap_or(false),
            cap_add: host.cap_add.unwrap_or_default(),
            cap_drop: host.cap_drop.unwrap_or_default(),
            memory: host.memory,
            nano_cpus: host.nano_cpus,
            cpu_quota: host.cpu_quota,
        },
    }
}

fn create_config(request: &CreateRequest) -> Config<String> {
    let port_bindings = request.port_bindings.as_ref().map(|ports| {
        ports
            .iter()
            .map(|(port, bindings)| {
                let bindings = bindings
                    .iter()
                    .map(|b| bollard::models::PortBinding {
                        host_ip: b.host_ip.clone(),
                        host_port: b.host_port.clone(),
                    })
                    .collect();
                (port.clone(), Some(bindings))
            })
            .collect()
    });
    // Published ports must also be exposed for the bindings to apply.
    let exposed_ports = request.port_bindings.as_ref().map(|ports| {
        ports
            .keys()
            .map(|port| (port.clone(), HashMap::new()))
            .collect()
    });

    let mounts = request.mounts.as_ref().map(|mounts| {
        mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.source.clone()),
                typ: Some(mount_kind_from_str(&m.kind)),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect()
    });

    let host_config = HostConfig {
        port_bindings,
        binds: request.binds.clone(),
        mounts,
        network_mode: request.network_mode.clone(),
        restart_policy: request
            .restart_policy
            .as_ref()
            .map(|p| bollard::models::RestartPolicy {
                name: Some(restart_name_from_str(&p.name)),
                maximum_retry_count: Some(p.maximum_retry_count),
            }),
        privileged: request.privileged,
        cap_add: request.cap_add.clone(),
        cap_drop: request.cap_drop.clone(),
        memory: request.memory,
        nano_cpus: request.nano_cpus,
        cpu_quota: request.cpu_quota,
        ..Default::default()
    };

    Config {
        image: Some(request.image.clone()),
        env: request.env.clone(),
        cmd: request.cmd.clone(),
        entrypoint: request.entrypoint.clone(),
        working_dir: request.working_dir.clone(),
        user: request.user.clone(),
        labels: request.labels.clone(),
        exposed_ports,
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<Container>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let summaries = self.docker.list_containers(Some(opts)).await?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            match self.inspect_container(&id).await {
                Ok(container) => containers.push(container),
                // Stopped and removed between list and inspect.
                Err(RuntimeError::NotFound(_)) => debug!("Container {} vanished", id),
                Err(e) => return Err(e),
            }
        }
        Ok(containers)
    }

    async fn inspect_container(&self, id_or_name: &str) -> Result<Container, RuntimeError> {
        let detail = self
            .docker
            .inspect_container(id_or_name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| not_found_or(id_or_name, e))?;
        Ok(container_from_inspect(detail))
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageDetails>, RuntimeError> {
        match self.docker.inspect_image(reference).await {
            Ok(image) => Ok(Some(ImageDetails {
                id: image.id.unwrap_or_default(),
                repo_tags: image.repo_tags.unwrap_or_default(),
                repo_digests: image.repo_digests.unwrap_or_default(),
            })),
            Err(e) if status_code(&e) == Some(404) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, repository: &str, tag: &str) -> Result<(), RuntimeError> {
        let reference = if tag.is_empty() {
            repository.to_string()
        } else {
            format!("{}:{}", repository, tag)
        };
        let options = CreateImageOptions {
            from_image: repository.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(|e| pull_error(&reference, e))?;
            if let Some(error) = info.error {
                return Err(pull_error(
                    &reference,
                    DockerError::DockerStreamError { error },
                ));
            }
            match (info.id, info.status, info.progress) {
                (_, Some(status), Some(progress)) if !progress.is_empty() => {
                    debug!("  {}: {}", status, progress)
                }
                (Some(id), Some(status), _) => debug!("  {}: {}", id, status),
                _ => {}
            }
        }

        info!("Successfully pulled image: {}", reference);
        Ok(())
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) => Err(not_found_or(id, e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(id, None::<RemoveContainerOptions>)
            .await
            .map_err(|e| not_found_or(id, e))
    }

    async fn create_and_start(&self, request: &CreateRequest) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: request.name.clone(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), create_config(request))
            .await?;
        for warning in &created.warnings {
            info!("Docker warning for {}: {}", request.name, warning);
        }

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(created.id)
    }

    async fn prune_images(&self, dangling_only: bool) -> Result<PruneStats, RuntimeError> {
        let dangling = if dangling_only { "true" } else { "false" };
        let filters = HashMap::from([("dangling".to_string(), vec![dangling.to_string()])]);
        let response = self
            .docker
            .prune_images(Some(PruneImagesOptions { filters }))
            .await?;

        Ok(PruneStats {
            images_deleted: response
                .images_deleted
                .map(|deleted| deleted.len() as u64)
                .unwrap_or(0),
            space_reclaimed: response.space_reclaimed.unwrap_or(0).max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::ContainerConfig;

    fn inspect_fixture() -> ContainerInspectResponse {
        ContainerInspectResponse {
            id: Some("f00dfeedbeef0000".into()),
            name: Some("/web".into()),
            image: Some("sha256:abc".into()),
            config: Some(ContainerConfig {
                image: Some("nginx:1.27".into()),
                hostname: Some("f00dfeedbeef".into()),
                env: Some(vec!["A=1".into()]),
                labels: Some(HashMap::from([("x".to_string(), "y".to_string())])),
                ..Default::default()
            }),
            host_config: Some(HostConfig {
                port_bindings: Some(HashMap::from([(
                    "80/tcp".to_string(),
                    Some(vec![bollard::models::PortBinding {
                        host_ip: Some("".into()),
                        host_port: Some("8080".into()),
                    }]),
                )])),
                mounts: Some(vec![Mount {
                    target: Some("/data".into()),
                    source: Some("webdata".into()),
                    typ: Some(MountTypeEnum::VOLUME),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                restart_policy: Some(bollard::models::RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: Some(0),
                }),
                memory: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn converts_inspect_response() {
        let container = container_from_inspect(inspect_fixture());
        assert_eq!(container.name, "web");
        assert_eq!(container.image_id, "sha256:abc");
        assert_eq!(container.config.image, "nginx:1.27");
        assert_eq!(container.config.hostname.as_deref(), Some("f00dfeedbeef"));
        assert_eq!(container.config.port_bindings["80/tcp"][0].host_port.as_deref(), Some("8080"));
        assert_eq!(container.config.mounts[0].kind, "volume");
        assert!(container.config.mounts[0].read_only);
        assert_eq!(
            container.config.restart_policy.as_ref().map(|p| p.name.as_str()),
            Some("unless-stopped")
        );
        assert!(!container.config.privileged);
    }

    #[test]
    fn create_config_round_trips_snapshot() {
        let container = container_from_inspect(inspect_fixture());
        let request = CreateRequest::from_snapshot(&container.name, &container.config);
        let config = create_config(&request);

        assert_eq!(config.image.as_deref(), Some("nginx:1.27"));
        assert_eq!(config.env, Some(vec!["A=1".to_string()]));
        assert!(config.exposed_ports.unwrap().contains_key("80/tcp"));
        let host = config.host_config.unwrap();
        assert_eq!(host.mounts.unwrap()[0].typ, Some(MountTypeEnum::VOLUME));
        assert_eq!(
            host.restart_policy.unwrap().name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
        // Zero memory means "unlimited" and is left to the daemon.
        assert_eq!(host.memory, None);
        assert_eq!(host.privileged, None);
        assert_eq!(config.cmd, None);
    }

    #[test]
    fn registry_absence_messages() {
        assert!(is_registry_absence(
            "pull access denied for myapp, repository does not exist or may require 'docker login'"
        ));
        assert!(is_registry_absence("manifest for acme/api:9 not found: manifest unknown"));
        assert!(!is_registry_absence("Get \"https://registry-1.docker.io/v2/\": net/http: TLS handshake timeout"));
    }

    #[test]
    fn pull_errors_are_classified() {
        let absent = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "pull access denied for myapp".into(),
        };
        assert!(matches!(pull_error("myapp:1", absent), RuntimeError::NotInRegistry(_)));

        let flaky = DockerError::DockerStreamError {
            error: "unexpected EOF".into(),
        };
        assert!(matches!(pull_error("redis:7", flaky), RuntimeError::Api(_)));
    }
}
