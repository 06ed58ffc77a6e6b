//! Repository-driven signing inputs.
//!
//! The repo flows start from repository names rather than explicit
//! references: enumerate tags, drop signature artifacts, and fan out into
//! per-tag sign requests.  A second flow lists a namespace's tags within a
//! last-modified window.

use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::registry::Registry;
use crate::sign::SignRequest;

/// Tag suffixes that mark signature artifacts, not images.
pub const SIGNATURE_TAG_SUFFIXES: [&str; 3] = [".sig", ".att", ".sbom"];

fn is_signature_tag(tag: &str) -> bool {
    SIGNATURE_TAG_SUFFIXES
        .iter()
        .any(|suffix| tag.ends_with(suffix))
}

/// The repositories to work on: one per line from the repos file when it
/// exists, else the inline list.  An empty selection is an error.
pub async fn decide_repos(repos: &[String], file: Option<&Path>) -> Result<Vec<String>> {
    if let Some(path) = file {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let repos: Vec<String> = content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect();
                if repos.is_empty() {
                    return Err(PipelineError::NoRepositories);
                }
                return Ok(repos);
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(_) => return Err(PipelineError::RepoFile(path.to_path_buf())),
        }
    }
    if repos.is_empty() {
        return Err(PipelineError::NoRepositories);
    }
    Ok(repos.to_vec())
}

/// One sign request per live tag of `repo` and identity base.
///
/// `repo` is a full `registry/namespace/name`.  The identity path is
/// everything after the namespace, with the `/` that repository names
/// flatten into `----` restored, so the repository `acme----billing`
/// under base `registry.example.com` is anchored as
/// `registry.example.com/acme/billing:<tag>`.
pub async fn repo_sign_requests<R: Registry + ?Sized>(
    registry: &R,
    repo: &str,
    identity_bases: &[String],
    signing_key: &str,
) -> Result<Vec<SignRequest>> {
    let Some((_, repository)) = repo.split_once('/') else {
        return Err(PipelineError::MalformedReference(repo.to_string()));
    };
    let name = repository
        .split_once('/')
        .map_or(repository, |(_, name)| name);
    let identity_path = name.replace("----", "/");

    let mut requests = Vec::new();
    for tag in registry.tags(repository).await? {
        if is_signature_tag(&tag) {
            debug!("Skipping signature artifact {repo}:{tag}");
            continue;
        }
        for base in identity_bases {
            requests.push(SignRequest::new(
                format!("{repo}:{tag}"),
                Some(format!("{base}/{identity_path}:{tag}")),
                signing_key,
            ));
        }
    }
    Ok(requests)
}

/// Whether a tag's last-modified time falls inside the requested window.
/// With bounds set, a tag whose timestamp is missing or unparseable is
/// excluded.
fn within_bounds(
    label: &str,
    last_modified: Option<&str>,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
) -> bool {
    if not_before.is_none() && not_after.is_none() {
        return true;
    }
    let Some(raw) = last_modified else {
        warn!("{label}: no last_modified timestamp, excluding");
        return false;
    };
    let modified = match DateTime::parse_from_rfc2822(raw) {
        Ok(modified) => modified.with_timezone(&Utc),
        Err(error) => {
            warn!("{label}: unparseable last_modified {raw:?} ({error}), excluding");
            return false;
        }
    };
    if not_before.is_some_and(|bound| modified < bound) {
        return false;
    }
    if not_after.is_some_and(|bound| modified > bound) {
        return false;
    }
    true
}

/// `namespace/name:tag` lines for every live tag in `namespace` whose
/// last-modified time falls inside the optional bounds.
pub async fn latest_repo_tags<R: Registry + ?Sized>(
    registry: &R,
    namespace: &str,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for repo in registry.repositories(namespace).await? {
        let full_name = repo.full_name();
        for tag in registry.tag_details(&full_name).await? {
            if is_signature_tag(&tag.name) {
                continue;
            }
            let label = format!("{full_name}:{}", tag.name);
            if !within_bounds(&label, tag.last_modified.as_deref(), not_before, not_after) {
                continue;
            }
            lines.push(label);
        }
    }
    Ok(lines)
}
