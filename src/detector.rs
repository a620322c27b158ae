//! Update detection by pull-and-compare.
//!
//! The digest of the local image is read, the same `repository:tag` is
//! pulled, and the digest is read again.  A changed digest means the
//! registry holds a newer image, which the pull has already fetched.

use log::{error, info, warn};

use crate::classifier;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::types::{CheckOutcome, Container, ImageDetails, SkipReason};

/// Name a container's image by tag, if it has one.
///
/// Prefers the first repo tag of the running image, then the configured
/// image string unless that is itself a content hash.
pub async fn tagged_reference(runtime: &dyn ContainerRuntime, container: &Container) -> Option<String> {
    match runtime.inspect_image(&container.image_id).await {
        Ok(Some(image)) => {
            if let Some(tag) = image.repo_tags.into_iter().find(|t| !t.is_empty() && t != "<none>:<none>") {
                return Some(tag);
            }
        }
        Ok(None) => {}
        Err(e) => warn!("Failed to inspect image of {}: {}", container.name, e),
    }

    let configured = container.config.image.as_str();
    if configured.is_empty() || configured.starts_with("sha256:") {
        None
    } else {
        Some(configured.to_string())
    }
}

/// Split a reference into the repository and tag to pull.
///
/// A missing tag means `latest`. A `:` inside a registry host is not a tag
/// separator. Digest-pinned references are pulled as a whole.
pub fn split_reference(reference: &str) -> (String, String) {
    if reference.contains('@') {
        return (reference.to_string(), String::new());
    }
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (reference.to_string(), "latest".to_string()),
    }
}

async fn local_image(runtime: &dyn ContainerRuntime, reference: &str) -> Option<ImageDetails> {
    match runtime.inspect_image(reference).await {
        Ok(image) => image,
        Err(e) => {
            error!("Error getting image digest for {}: {}", reference, e);
            None
        }
    }
}

/// Local digest of `reference`: first repo digest, else the image id.
pub async fn local_digest(runtime: &dyn ContainerRuntime, reference: &str) -> Option<String> {
    local_image(runtime, reference)
        .await
        .and_then(|image| image.current_digest())
}

/// Compare the digests read before and after a pull.
pub fn compare_digests(old: Option<&str>, new: Option<&str>) -> CheckOutcome {
    match (old, new) {
        (Some(old), Some(new)) if !old.is_empty() && !new.is_empty() && old != new => {
            CheckOutcome::UpdateAvailable
        }
        _ => CheckOutcome::UpToDate,
    }
}

/// Map a failed pull to an outcome.
pub fn pull_failure(err: RuntimeError) -> CheckOutcome {
    match err {
        RuntimeError::NotInRegistry(_) => CheckOutcome::Skipped(SkipReason::NotInRegistry),
        other => CheckOutcome::Error(other.to_string()),
    }
}

/// Check whether a newer image exists for `container`.
///
/// Never fails: every problem is folded into the returned outcome.
pub async fn check_for_update(runtime: &dyn ContainerRuntime, container: &Container) -> CheckOutcome {
    let Some(reference) = tagged_reference(runtime, container).await else {
        info!("Skipping {}: no tagged image name (local build)", container.name);
        return CheckOutcome::Skipped(SkipReason::Untagged);
    };

    let local = local_image(runtime, &reference).await;
    if classifier::is_local_only(&reference, local.as_ref()) {
        info!("Skipping {}: local-only image '{}'", container.name, reference);
        return CheckOutcome::Skipped(SkipReason::LocalOnly);
    }
    let old_digest = local.and_then(|image| image.current_digest());

    let (repository, tag) = split_reference(&reference);
    info!("Pulling image: {}:{}", repository, tag);
    if let Err(e) = runtime.pull_image(&repository, &tag).await {
        let outcome = pull_failure(e);
        match &outcome {
            CheckOutcome::Skipped(_) => {
                info!("Skipping {}: '{}' not found in registry", container.name, reference)
            }
            CheckOutcome::Error(msg) => error!("Failed to pull image {}: {}", reference, msg),
            _ => {}
        }
        return outcome;
    }

    let new_digest = local_digest(runtime, &reference).await;
    let outcome = compare_digests(old_digest.as_deref(), new_digest.as_deref());
    if outcome == CheckOutcome::UpdateAvailable {
        info!("Update available for {}: {}", container.name, reference);
    } else {
        info!("No update available for {}: {}", container.name, reference);
    }
    outcome
}
