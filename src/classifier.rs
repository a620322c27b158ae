//! Local-only image classification.
//!
//! Decides whether an image reference is worth checking against a registry.
//! The decision is an ordered list of [`Rule`]s; the first rule with a
//! conclusive [`Verdict`] wins.  This is a heuristic: a pullable image may be
//! treated as local, and an image that is absent locally is always allowed
//! to attempt a pull, even when its name suggests a private build.

use log::debug;

use crate::types::ImageDetails;

/// What a rule concluded about an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    LocalOnly,
    RegistryBacked,
    Inconclusive,
}

/// Facts a rule can look at.
#[derive(Debug, Clone, Copy)]
pub struct ImageFacts<'a> {
    pub reference: &'a str,
    /// `None` when the image is not present locally.
    pub local: Option<&'a ImageDetails>,
}

/// A named predicate over [`ImageFacts`].
pub struct Rule {
    pub name: &'static str,
    pub check: fn(&ImageFacts<'_>) -> Verdict,
}

/// Rules in priority order.
pub const RULES: &[Rule] = &[
    Rule {
        name: "content-hash-reference",
        check: content_hash_reference,
    },
    Rule {
        name: "no-repo-digests",
        check: no_repo_digests,
    },
    Rule {
        name: "registry-host-digest",
        check: registry_host_digest,
    },
    Rule {
        name: "official-image-digest",
        check: official_image_digest,
    },
    Rule {
        name: "local-digests-only",
        check: local_digests_only,
    },
    Rule {
        name: "absent-may-pull",
        check: absent_may_pull,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub local_only: bool,
    /// Name of the deciding rule.
    pub rule: &'static str,
}

pub fn classify(facts: &ImageFacts<'_>) -> Classification {
    for rule in RULES {
        match (rule.check)(facts) {
            Verdict::Inconclusive => continue,
            verdict => {
                debug!(
                    "Image {} classified by rule {}: {:?}",
                    facts.reference, rule.name, verdict
                );
                return Classification {
                    local_only: verdict == Verdict::LocalOnly,
                    rule: rule.name,
                };
            }
        }
    }
    Classification {
        local_only: false,
        rule: "default",
    }
}

/// Shorthand for `classify(..).local_only`.
pub fn is_local_only(reference: &str, local: Option<&ImageDetails>) -> bool {
    classify(&ImageFacts { reference, local }).local_only
}

/// The reference without its tag or digest (`ghcr.io/a/b:1` -> `ghcr.io/a/b`).
pub fn image_base(reference: &str) -> &str {
    let without_digest = reference.split('@').next().unwrap_or(reference);
    match without_digest.rsplit_once(':') {
        Some((base, tag)) if !tag.contains('/') => base,
        _ => without_digest,
    }
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':')
}

fn digest_repositories<'a>(image: &'a ImageDetails) -> impl Iterator<Item = &'a str> {
    image
        .repo_digests
        .iter()
        .map(|d| d.split('@').next().unwrap_or(d.as_str()))
}

fn content_hash_reference(facts: &ImageFacts<'_>) -> Verdict {
    if facts.reference.is_empty() || facts.reference.starts_with("sha256:") {
        Verdict::LocalOnly
    } else {
        Verdict::Inconclusive
    }
}

fn no_repo_digests(facts: &ImageFacts<'_>) -> Verdict {
    match facts.local {
        Some(image) if image.repo_digests.is_empty() => Verdict::LocalOnly,
        _ => Verdict::Inconclusive,
    }
}

fn registry_host_digest(facts: &ImageFacts<'_>) -> Verdict {
    let Some(image) = facts.local else {
        return Verdict::Inconclusive;
    };
    let found = digest_repositories(image).any(|repo| match repo.split_once('/') {
        Some((first, _)) => is_registry_host(first),
        None => false,
    });
    if found {
        Verdict::RegistryBacked
    } else {
        Verdict::Inconclusive
    }
}

fn official_image_digest(facts: &ImageFacts<'_>) -> Verdict {
    let Some(image) = facts.local else {
        return Verdict::Inconclusive;
    };
    let base = image_base(facts.reference);
    let last = base.rsplit('/').next().unwrap_or(base);
    let found = digest_repositories(image)
        .filter(|repo| !repo.contains('/'))
        .any(|repo| repo == base || repo == last);
    if found {
        Verdict::RegistryBacked
    } else {
        Verdict::Inconclusive
    }
}

fn local_digests_only(facts: &ImageFacts<'_>) -> Verdict {
    if facts.local.is_some() {
        Verdict::LocalOnly
    } else {
        Verdict::Inconclusive
    }
}

// Namespaced, host-qualified and bare names alike are given a chance to pull.
fn absent_may_pull(facts: &ImageFacts<'_>) -> Verdict {
    if facts.local.is_none() {
        Verdict::RegistryBacked
    } else {
        Verdict::Inconclusive
    }
}
