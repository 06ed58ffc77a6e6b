//! Container image reference parsing.
//!
//! A textual reference like `quay.io/containers/podman:latest` or
//! `quay.io/containers/podman@sha256:…` is split into its addressing parts:
//! the registry host (everything before the first `/`), the image path, and
//! either a tag (after the last `:`) or a digest (after the last `@`).
//! Splitting the digest form on the *last* `@` keeps the embedded
//! `sha256:`-style colon out of the tag logic.

use std::fmt;
use std::str::FromStr;

use crate::error::{PipelineError, Result};
use crate::MULTIARCH;

/// One manifest digest discovered for an image, together with the
/// architecture it applies to.  The architecture is empty for a plain
/// single-platform manifest and `"multiarch"` for the locally computed
/// digest of a whole manifest list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestArch {
    pub digest: String,
    pub arch: String,
}

impl DigestArch {
    pub fn new(digest: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            digest: digest.into(),
            arch: arch.into(),
        }
    }

    /// True for the synthetic digest covering a whole manifest list.
    pub fn is_multiarch(&self) -> bool {
        self.arch == MULTIARCH
    }
}

/// A container image reference split into its addressing parts.
///
/// Freshly parsed values carry either a tag and no digests, or no tag and a
/// single (digest, "") pair.  The digest resolver replaces the value with
/// one whose `manifests` are fully populated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerParts {
    pub registry: String,
    pub image: String,
    pub tag: Option<String>,
    pub manifests: Vec<DigestArch>,
}

impl ContainerParts {
    /// Split `reference` into registry, image, and tag or digest.
    ///
    /// Fails with [`PipelineError::MalformedReference`] when the registry
    /// separator is missing, when neither `:` nor `@` is present in the
    /// remainder, or when any resulting part is empty.
    pub fn parse(reference: &str) -> Result<Self> {
        let malformed = || PipelineError::MalformedReference(reference.to_string());

        let (registry, rest) = reference.split_once('/').ok_or_else(malformed)?;
        if registry.is_empty() {
            return Err(malformed());
        }

        if let Some(at) = rest.rfind('@') {
            let (image, digest) = (&rest[..at], &rest[at + 1..]);
            if image.is_empty() || digest.is_empty() {
                return Err(malformed());
            }
            Ok(Self {
                registry: registry.to_string(),
                image: image.to_string(),
                tag: None,
                manifests: vec![DigestArch::new(digest, "")],
            })
        } else if let Some(colon) = rest.rfind(':') {
            let (image, tag) = (&rest[..colon], &rest[colon + 1..]);
            if image.is_empty() || tag.is_empty() {
                return Err(malformed());
            }
            Ok(Self {
                registry: registry.to_string(),
                image: image.to_string(),
                tag: Some(tag.to_string()),
                manifests: vec![],
            })
        } else {
            Err(malformed())
        }
    }

    /// The human-friendly pull reference, available only when the parse
    /// carried a tag.
    pub fn reference(&self) -> Option<String> {
        self.tag
            .as_ref()
            .map(|tag| format!("{}/{}:{}", self.registry, self.image, tag))
    }

    /// The address used to fetch this image's manifest: by tag when one is
    /// present, otherwise by the first known digest.
    pub fn fetch_address(&self) -> Result<String> {
        if let Some(tag) = &self.tag {
            Ok(format!("{}/{}:{}", self.registry, self.image, tag))
        } else if let Some(first) = self.manifests.first() {
            Ok(format!("{}/{}@{}", self.registry, self.image, first.digest))
        } else {
            Err(PipelineError::MalformedReference(format!(
                "{}/{} carries neither tag nor digest",
                self.registry, self.image
            )))
        }
    }
}

impl fmt::Display for ContainerParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.tag, self.manifests.first()) {
            (Some(tag), _) => write!(f, "{}/{}:{}", self.registry, self.image, tag),
            (None, Some(first)) => write!(f, "{}/{}@{}", self.registry, self.image, first.digest),
            (None, None) => write!(f, "{}/{}", self.registry, self.image),
        }
    }
}

impl FromStr for ContainerParts {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
