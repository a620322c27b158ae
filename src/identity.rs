//! Working out which container this process runs in.

use log::{info, warn};

use crate::runtime::ContainerRuntime;
use crate::types::Container;

/// Resolve the name of our own container, first match wins:
///
/// 1. the hostname used as a container id,
/// 2. an explicitly configured name,
/// 3. a running container whose internal hostname equals ours.
pub async fn resolve_self(
    runtime: &dyn ContainerRuntime,
    hostname: &str,
    explicit: Option<&str>,
) -> Option<String> {
    if !hostname.is_empty() {
        if let Ok(container) = runtime.inspect_container(hostname).await {
            info!("Self-detection: Running as container '{}'", container.name);
            return Some(container.name);
        }
    }

    if let Some(name) = explicit.filter(|n| !n.is_empty()) {
        info!("Self-detection: Using explicit container name '{}'", name);
        return Some(name.to_string());
    }

    if !hostname.is_empty() {
        match runtime.list_running().await {
            Ok(containers) => {
                if let Some(container) = containers
                    .into_iter()
                    .find(|c| c.config.hostname.as_deref() == Some(hostname))
                {
                    info!("Self-detection: Found self as container '{}'", container.name);
                    return Some(container.name);
                }
            }
            Err(e) => warn!("Self-detection: Failed to list containers: {}", e),
        }
    }

    warn!("Self-detection: Could not determine own container name");
    None
}

/// Whether `container` is the one this process runs in.
///
/// Without a resolved name, falls back to matching the container id
/// against the hostname.
pub fn is_self(container: &Container, self_name: Option<&str>, hostname: &str) -> bool {
    if let Some(name) = self_name {
        return container.name == name;
    }
    if hostname.is_empty() {
        return false;
    }
    let short_hostname = hostname.get(..12).unwrap_or(hostname);
    container.id.starts_with(hostname) || container.short_id() == short_hostname
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use crate::types::RuntimeConfig;

    fn config(hostname: &str) -> RuntimeConfig {
        RuntimeConfig {
            image: "img:1".into(),
            hostname: Some(hostname.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn hostname_as_container_id_wins() {
        let runtime = MockRuntime::new();
        let me = runtime.add_container("watcher", config("x"));
        let resolved = resolve_self(&runtime, &me.id, Some("override")).await;
        assert_eq!(resolved.as_deref(), Some("watcher"));
    }

    #[tokio::test]
    async fn explicit_name_beats_hostname_scan() {
        let runtime = MockRuntime::new();
        runtime.add_container("watcher", config("box"));
        let resolved = resolve_self(&runtime, "box", Some("configured")).await;
        assert_eq!(resolved.as_deref(), Some("configured"));
    }

    #[tokio::test]
    async fn falls_back_to_internal_hostname() {
        let runtime = MockRuntime::new();
        runtime.add_container("db", config("db-host"));
        runtime.add_container("watcher", config("box"));
        let resolved = resolve_self(&runtime, "box", None).await;
        assert_eq!(resolved.as_deref(), Some("watcher"));
    }

    #[tokio::test]
    async fn unknown_when_nothing_matches() {
        let runtime = MockRuntime::new();
        runtime.add_container("db", config("db-host"));
        assert_eq!(resolve_self(&runtime, "laptop", None).await, None);
        assert_eq!(resolve_self(&runtime, "", Some("")).await, None);
    }

    #[test]
    fn is_self_matches_name_or_id_prefix() {
        let container = Container {
            id: "0123456789abcdef0123".into(),
            name: "watcher".into(),
            image_id: String::new(),
            config: RuntimeConfig::default(),
        };
        assert!(is_self(&container, Some("watcher"), "whatever"));
        assert!(!is_self(&container, Some("other"), "0123456789ab"));
        assert!(is_self(&container, None, "0123456789ab"));
        assert!(is_self(&container, None, "0123456789abcdef"));
        assert!(!is_self(&container, None, "laptop"));
        assert!(!is_self(&container, None, ""));
    }
}
