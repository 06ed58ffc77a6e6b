//! Legacy detached-signature retrieval.
//!
//! Old-style signatures live on a static file host, one GPG-wrapped JSON
//! claim per signature, numbered from 1 under a per-image-and-digest
//! directory.  Enumeration walks the numbers until the host answers 404.

use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{PipelineError, Result};

pub const ATOMIC_SIGNATURE_TYPE: &str = "atomic container signature";

/// The claim carried by one legacy signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacySignature {
    pub critical: Critical,
    #[serde(default)]
    pub optional: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critical {
    pub image: CriticalImage,
    #[serde(rename = "type")]
    pub type_: String,
    pub identity: CriticalIdentity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalImage {
    #[serde(rename = "docker-manifest-digest")]
    pub docker_manifest_digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalIdentity {
    #[serde(rename = "docker-reference")]
    pub docker_reference: String,
}

impl LegacySignature {
    pub fn new(docker_reference: impl Into<String>, digest: impl Into<String>) -> Self {
        LegacySignature {
            critical: Critical {
                image: CriticalImage {
                    docker_manifest_digest: digest.into(),
                },
                type_: ATOMIC_SIGNATURE_TYPE.to_string(),
                identity: CriticalIdentity {
                    docker_reference: docker_reference.into(),
                },
            },
            optional: serde_json::Map::new(),
        }
    }
}

/// Source of legacy signatures for an image at a digest.
#[async_trait]
pub trait LegacyStore: Send + Sync {
    /// All signatures published for `image` at `digest` (`sha256:...` form).
    async fn signatures(&self, image: &str, digest: &str) -> Result<Vec<LegacySignature>>;
}

fn signature_url(base_url: &str, image: &str, digest: &str, index: u32) -> String {
    // the host keys on the bare hex, not the prefixed digest
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    format!("{base_url}{image}@sha256={hex}/signature-{index}")
}

/// [`LegacyStore`] backed by a sigstore file host, unwrapping each
/// signature through the local gpg binary.  `base_url` is expected to end
/// with a slash.
#[derive(Debug, Clone)]
pub struct SigstoreClient {
    client: reqwest::Client,
    base_url: String,
}

impl SigstoreClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        SigstoreClient {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn decode(&self, armored: &[u8]) -> Result<LegacySignature> {
        let mut child = Command::new("gpg")
            .arg("-d")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let mut stdin = child.stdin.take().ok_or_else(|| {
            PipelineError::SignatureDecode("gpg stdin unavailable".to_string())
        })?;
        stdin.write_all(armored).await?;
        drop(stdin);
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(PipelineError::SignatureDecode(format!(
                "gpg -d failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[async_trait]
impl LegacyStore for SigstoreClient {
    async fn signatures(&self, image: &str, digest: &str) -> Result<Vec<LegacySignature>> {
        let mut signatures = Vec::new();
        for index in 1.. {
            let url = signature_url(&self.base_url, image, digest, index);
            debug!("Fetching {url}");
            let response = self.client.get(&url).send().await?;
            if response.status() == StatusCode::NOT_FOUND {
                break;
            }
            let body = response.error_for_status()?.bytes().await?;
            signatures.push(self.decode(&body).await?);
        }
        Ok(signatures)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn urls_number_from_one_and_drop_the_digest_prefix() {
        let base = "https://sigs.example.com/content/sigstore/";
        assert_eq!(
            signature_url(base, "ubi8/ubi", "sha256:abc123", 1),
            "https://sigs.example.com/content/sigstore/ubi8/ubi@sha256=abc123/signature-1"
        );
        // already-bare digests pass through unchanged
        assert_eq!(
            signature_url(base, "ubi8/ubi", "abc123", 7),
            "https://sigs.example.com/content/sigstore/ubi8/ubi@sha256=abc123/signature-7"
        );
    }

    #[test]
    fn deserializes_the_atomic_claim_layout() {
        let claim = r#"{
            "critical": {
                "image": {
                    "docker-manifest-digest": "sha256:9f4e6d5b"
                },
                "type": "atomic container signature",
                "identity": {
                    "docker-reference": "registry.example.com/ubi8:latest"
                }
            },
            "optional": {
                "creator": "atomic 1.0"
            }
        }"#;
        let signature: LegacySignature = serde_json::from_str(claim).unwrap();
        assert_eq!(
            signature.critical.image.docker_manifest_digest,
            "sha256:9f4e6d5b"
        );
        assert_eq!(signature.critical.type_, ATOMIC_SIGNATURE_TYPE);
        assert_eq!(
            signature.critical.identity.docker_reference,
            "registry.example.com/ubi8:latest"
        );
        assert_eq!(
            signature.optional.get("creator"),
            Some(&serde_json::Value::from("atomic 1.0"))
        );
    }

    #[test]
    fn serializes_with_dashed_keys() {
        let signature = LegacySignature::new("registry.example.com/ubi8:latest", "sha256:aa");
        let value = serde_json::to_value(&signature).unwrap();
        assert_eq!(
            value["critical"]["image"]["docker-manifest-digest"],
            "sha256:aa"
        );
        assert_eq!(value["critical"]["type"], ATOMIC_SIGNATURE_TYPE);
        assert_eq!(
            value["critical"]["identity"]["docker-reference"],
            "registry.example.com/ubi8:latest"
        );
    }

    #[test]
    fn missing_optional_section_defaults_to_empty() {
        let claim = r#"{
            "critical": {
                "image": {"docker-manifest-digest": "sha256:aa"},
                "type": "atomic container signature",
                "identity": {"docker-reference": "r.example.com/app:1"}
            }
        }"#;
        let signature: LegacySignature = serde_json::from_str(claim).unwrap();
        assert!(signature.optional.is_empty());
    }
}
