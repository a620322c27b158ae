//! In-memory runtime for tests.
//!
//! Every mutating call is appended to an event log shared through
//! [`MockRuntime::event_log`] so tests can assert on call order, including
//! calls made by other collaborators writing to the same log.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ContainerRuntime, RuntimeError};
use crate::recreate::CreateRequest;
use crate::types::{Container, ImageDetails, PruneStats, RuntimeConfig};

/// What a pull of a given `repository:tag` does.
#[derive(Debug, Clone)]
pub enum PullBehavior {
    /// The registry has a new image; its repo digest becomes this value.
    NewDigest(String),
    Unchanged,
    NotInRegistry,
    Fail(String),
}

#[derive(Default)]
struct State {
    containers: Vec<Container>,
    images: HashMap<String, ImageDetails>,
    pulls: HashMap<String, PullBehavior>,
    failing_stops: HashSet<String>,
    fail_creates: bool,
    fail_list: bool,
    prune: PruneStats,
}

pub struct MockRuntime {
    state: Mutex<State>,
    events: Arc<Mutex<Vec<String>>>,
    next_id: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            events: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn fresh_id(&self) -> String {
        format!("{:064x}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn event_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.events)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Register a running container; its image id comes from a previously
    /// added image when one matches `config.image`.
    pub fn add_container(&self, name: &str, config: RuntimeConfig) -> Container {
        let id = self.fresh_id();
        let mut state = self.state.lock().unwrap();
        let image_id = state
            .images
            .get(&config.image)
            .map(|i| i.id.clone())
            .unwrap_or_else(|| format!("sha256:{}", name));
        let container = Container {
            id,
            name: name.to_string(),
            image_id,
            config,
        };
        state.containers.push(container.clone());
        container
    }

    /// Make an image visible under `reference` and under its id.
    pub fn add_image(&self, reference: &str, image: ImageDetails) {
        let mut state = self.state.lock().unwrap();
        state.images.insert(image.id.clone(), image.clone());
        state.images.insert(reference.to_string(), image);
    }

    pub fn set_pull(&self, reference: &str, behavior: PullBehavior) {
        self.state
            .lock()
            .unwrap()
            .pulls
            .insert(reference.to_string(), behavior);
    }

    pub fn set_prune_stats(&self, stats: PruneStats) {
        self.state.lock().unwrap().prune = stats;
    }

    pub fn fail_creates(&self) {
        self.state.lock().unwrap().fail_creates = true;
    }

    pub fn fail_stop(&self, id: &str) {
        self.state.lock().unwrap().failing_stops.insert(id.to_string());
    }

    pub fn fail_list(&self) {
        self.state.lock().unwrap().fail_list = true;
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_running(&self) -> Result<Vec<Container>, RuntimeError> {
        let state = self.state.lock().unwrap();
        if state.fail_list {
            return Err(RuntimeError::Other("connection refused".into()));
        }
        Ok(state.containers.clone())
    }

    async fn inspect_container(&self, id_or_name: &str) -> Result<Container, RuntimeError> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.id == id_or_name || c.name == id_or_name)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id_or_name.to_string()))
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageDetails>, RuntimeError> {
        Ok(self.state.lock().unwrap().images.get(reference).cloned())
    }

    async fn pull_image(&self, repository: &str, tag: &str) -> Result<(), RuntimeError> {
        let reference = format!("{}:{}", repository, tag);
        self.record(format!("pull {}", reference));

        let mut state = self.state.lock().unwrap();
        match state.pulls.get(&reference).cloned() {
            Some(PullBehavior::NewDigest(digest)) => {
                let id = self.fresh_id();
                let image = ImageDetails {
                    id: format!("sha256:{}", id),
                    repo_tags: vec![reference.clone()],
                    repo_digests: vec![format!("{}@{}", repository, digest)],
                };
                state.images.insert(image.id.clone(), image.clone());
                state.images.insert(reference, image);
                Ok(())
            }
            Some(PullBehavior::Unchanged) | None => Ok(()),
            Some(PullBehavior::NotInRegistry) => Err(RuntimeError::NotInRegistry(reference)),
            Some(PullBehavior::Fail(message)) => Err(RuntimeError::Other(message)),
        }
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.record(format!("stop {} {}", id, grace.as_secs()));
        if self.state.lock().unwrap().failing_stops.contains(id) {
            return Err(RuntimeError::Other(format!("cannot stop {}", id)));
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("remove {}", id));
        let mut state = self.state.lock().unwrap();
        let before = state.containers.len();
        state.containers.retain(|c| c.id != id);
        if state.containers.len() == before {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn create_and_start(&self, request: &CreateRequest) -> Result<String, RuntimeError> {
        self.record(format!("create {}", request.name));
        let id = self.fresh_id();
        let mut state = self.state.lock().unwrap();
        if state.fail_creates {
            return Err(RuntimeError::Other("create refused".into()));
        }
        let image_id = state
            .images
            .get(&request.image)
            .map(|i| i.id.clone())
            .unwrap_or_default();
        state.containers.push(Container {
            id: id.clone(),
            name: request.name.clone(),
            image_id,
            config: RuntimeConfig {
                image: request.image.clone(),
                env: request.env.clone().unwrap_or_default(),
                labels: request.labels.clone().unwrap_or_default(),
                ..Default::default()
            },
        });
        Ok(id)
    }

    async fn prune_images(&self, dangling_only: bool) -> Result<PruneStats, RuntimeError> {
        self.record(if dangling_only {
            "prune dangling".to_string()
        } else {
            "prune unused".to_string()
        });
        Ok(self.state.lock().unwrap().prune)
    }
}
