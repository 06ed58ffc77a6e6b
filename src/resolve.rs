//! Digest resolution.
//!
//! Given parsed reference parts, fetch the manifest and populate the full
//! set of (digest, architecture) pairs.  A manifest list contributes one
//! pair per child manifest plus one locally computed digest of the whole
//! list body tagged `"multiarch"`; a single-platform manifest contributes
//! one locally computed digest with an empty architecture.
//!
//! Digests are always recomputed over the bytes actually fetched.  A digest
//! reported by the registry (headers, embedded metadata) only describes
//! what the server *claims* to serve; the hash of the fetched body is what
//! a signature will actually cover.

use log::{debug, info};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};
use crate::reference::{ContainerParts, DigestArch};
use crate::registry::{Registry, MANIFEST_LIST_TYPE, MANIFEST_OCI_LIST_TYPE};
use crate::MULTIARCH;

/// `sha256:` + lowercase hex of the SHA-256 of `bytes`.
pub fn hash(bytes: &[u8]) -> String {
    let mut context = Sha256::new();
    context.update(bytes);
    format!("sha256:{}", hex::encode(context.finalize()))
}

/// The narrow view of a manifest body the resolver needs: the declared
/// media type and, for lists, the child digest/platform entries.
#[derive(Debug, Deserialize)]
struct ManifestView {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Vec<ChildManifest>,
}

#[derive(Debug, Deserialize)]
struct ChildManifest {
    digest: String,
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    architecture: String,
}

/// Fetch the manifest for `parts` and return a fresh value with fully
/// populated digest/arch pairs.  The input is left untouched; tag-form and
/// digest-form references are both resolved through a fetch so that the
/// digests always describe the bytes the registry actually serves.
pub async fn populate_digests<R: Registry + ?Sized>(
    registry: &R,
    parts: &ContainerParts,
) -> Result<ContainerParts> {
    let address = parts.fetch_address()?;
    info!("Fetching {address}");
    let body = registry.manifest(&address, None).await?;
    let resolved = expand(parts, &address, &body)?;
    debug!("{address} resolved to {} digests", resolved.manifests.len());
    Ok(resolved)
}

fn expand(parts: &ContainerParts, address: &str, body: &str) -> Result<ContainerParts> {
    let view: ManifestView = serde_json::from_str(body)?;
    let media_type = view.media_type.ok_or_else(|| PipelineError::ManifestType {
        reference: address.to_string(),
        media_type: "typed".to_string(),
    })?;

    let mut manifests = Vec::new();
    if media_type == MANIFEST_LIST_TYPE || media_type == MANIFEST_OCI_LIST_TYPE {
        for child in view.manifests {
            let platform = child.platform.ok_or_else(|| PipelineError::ManifestType {
                reference: address.to_string(),
                media_type: "platform-tagged".to_string(),
            })?;
            manifests.push(DigestArch::new(child.digest, platform.architecture));
        }
        manifests.push(DigestArch::new(hash(body.as_bytes()), MULTIARCH));
    } else {
        manifests.push(DigestArch::new(hash(body.as_bytes()), ""));
    }

    Ok(ContainerParts {
        registry: parts.registry.clone(),
        image: parts.image.clone(),
        tag: parts.tag.clone(),
        manifests,
    })
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::FakeRegistry;

    const ARCHES: [&str; 5] = ["amd64", "arm64", "arm", "ppc64le", "s390x"];

    fn manifest_list() -> String {
        let children = ARCHES
            .iter()
            .enumerate()
            .map(|(i, arch)| {
                format!(
                    r#"{{"mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                         "size": 949,
                         "digest": "sha256:{i:064}",
                         "platform": {{"architecture": "{arch}", "os": "linux"}}}}"#
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        format!(
            r#"{{"manifests": [{children}],
                 "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
                 "schemaVersion": 2}}"#
        )
    }

    fn single_manifest() -> String {
        r#"{"schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {"mediaType": "application/vnd.docker.container.image.v1+json",
                       "size": 5830, "digest": "sha256:aaaa"},
            "layers": [{"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                        "size": 76421592, "digest": "sha256:bbbb"}]}"#
            .to_string()
    }

    #[test]
    fn single_manifest_is_hashed_locally() {
        let parts = ContainerParts::parse("quay.io/ns/app:v1").unwrap();
        let body = single_manifest();
        let resolved = expand(&parts, "quay.io/ns/app:v1", &body).unwrap();
        assert_eq!(resolved.manifests, vec![DigestArch::new(hash(body.as_bytes()), "")]);
        assert_eq!(resolved.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn manifest_list_expands_to_children_plus_aggregate() {
        let parts = ContainerParts::parse("quay.io/containers/podman:latest").unwrap();
        let body = manifest_list();
        let resolved = expand(&parts, "quay.io/containers/podman:latest", &body).unwrap();

        assert_eq!(resolved.manifests.len(), ARCHES.len() + 1);
        for (i, arch) in ARCHES.iter().enumerate() {
            assert_eq!(resolved.manifests[i].digest, format!("sha256:{i:064}"));
            assert_eq!(resolved.manifests[i].arch, *arch);
        }
        let aggregate = resolved.manifests.last().unwrap();
        assert_eq!(aggregate.arch, MULTIARCH);
        // computed over the fetched body, not taken from the list metadata
        assert_eq!(aggregate.digest, hash(body.as_bytes()));
    }

    #[test]
    fn digest_form_is_replaced_wholesale() {
        let parts = ContainerParts::parse("quay.io/ns/app@sha256:feed").unwrap();
        let body = single_manifest();
        let resolved = expand(&parts, "quay.io/ns/app@sha256:feed", &body).unwrap();
        // the seeded digest is superseded by the locally computed one
        assert_eq!(resolved.manifests, vec![DigestArch::new(hash(body.as_bytes()), "")]);
        assert_eq!(resolved.tag, None);
    }

    #[test]
    fn missing_media_type_is_fatal() {
        let parts = ContainerParts::parse("quay.io/ns/app:v1").unwrap();
        match expand(&parts, "quay.io/ns/app:v1", r#"{"schemaVersion": 1}"#) {
            Err(PipelineError::ManifestType { reference, .. }) => {
                assert_eq!(reference, "quay.io/ns/app:v1")
            }
            other => panic!("expected ManifestType, got {other:?}"),
        }
    }

    #[test]
    fn list_entry_without_platform_is_fatal() {
        let parts = ContainerParts::parse("quay.io/ns/app:v1").unwrap();
        let body = r#"{"mediaType": "application/vnd.oci.image.index.v1+json",
                       "manifests": [{"digest": "sha256:cccc", "size": 7}]}"#;
        assert!(matches!(
            expand(&parts, "quay.io/ns/app:v1", body),
            Err(PipelineError::ManifestType { .. })
        ));
    }

    #[test]
    fn unparseable_body_is_fatal() {
        let parts = ContainerParts::parse("quay.io/ns/app:v1").unwrap();
        assert!(matches!(
            expand(&parts, "quay.io/ns/app:v1", "not json"),
            Err(PipelineError::Json(_))
        ));
    }

    #[tokio::test]
    async fn resolves_through_a_registry() {
        let registry = FakeRegistry::new();
        let body = manifest_list();
        registry.put_manifest(
            "quay.io/containers/podman:latest",
            crate::registry::MANIFEST_LIST_TYPE,
            &body,
        );

        let parts = ContainerParts::parse("quay.io/containers/podman:latest").unwrap();
        let resolved = populate_digests(&registry, &parts).await.unwrap();
        assert_eq!(resolved.manifests.len(), 6);

        let absent = ContainerParts::parse("quay.io/containers/absent:latest").unwrap();
        assert!(matches!(
            populate_digests(&registry, &absent).await,
            Err(PipelineError::ManifestNotFound(_))
        ));
    }

    #[tokio::test]
    async fn manifest_digest_covers_the_served_body() {
        let registry = FakeRegistry::new();
        let body = single_manifest();
        registry.put_manifest("quay.io/ns/app:v1", crate::registry::MANIFEST_V2S2_TYPE, &body);

        let digest = registry.manifest_digest("quay.io/ns/app:v1").await.unwrap();
        assert_eq!(digest, hash(body.as_bytes()));
    }
}
