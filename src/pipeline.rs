//! End-to-end flows.
//!
//! Each flow is thin glue over the library stages: turn some input shape
//! into sign requests, resolve them to digest-level entries, then either
//! sign in chunks or verify and report.  All policy (chunking, executors,
//! timeouts) arrives through options; the seams arrive as trait objects so
//! flows are testable without a network or any binaries.

use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::cosign::CosignVerifier;
use crate::error::Result;
use crate::executor::Executor;
use crate::reference::ContainerParts;
use crate::registry::Registry;
use crate::report::{evaluate, Cell, ReportSink, DEFAULT_RANGE};
use crate::repos::{decide_repos, repo_sign_requests};
use crate::resolve::populate_digests;
use crate::sign::{sign_entries_from_parts, SignEntry, SignRequest};
use crate::signer::{sign_entries, SignOptions, SignOutcome, SignatureStore, SignerBackend};
use crate::sigstore::LegacyStore;
use crate::snapshot::Snapshot;
use crate::verify::{verify_cosign, verify_legacy, DEFAULT_ARCH};

/// The two executor lanes of the pipeline.
///
/// Digest resolution is I/O-bound fan-out and defaults to concurrent
/// tasks; chunk submission defaults to strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Executors {
    pub preprocess: Executor,
    pub signing: Executor,
}

impl Default for Executors {
    fn default() -> Self {
        Executors {
            preprocess: Executor::default(),
            signing: Executor::Sequential,
        }
    }
}

/// Knobs for the verification flow.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub default_arch: String,
    pub range: String,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        VerifyOptions {
            default_arch: DEFAULT_ARCH.to_string(),
            range: DEFAULT_RANGE.to_string(),
        }
    }
}

/// Parse and resolve `requests` into digest-level sign entries,
/// element-wise through `executor`.
pub async fn resolve_entries<R>(
    registry: &Arc<R>,
    requests: Vec<SignRequest>,
    executor: Executor,
) -> Result<Vec<SignEntry>>
where
    R: Registry + 'static,
{
    let registry = Arc::clone(registry);
    let per_request = executor
        .try_map(requests, move |request| {
            let registry = Arc::clone(&registry);
            async move {
                let parts = ContainerParts::parse(&request.reference)?;
                let resolved = populate_digests(&*registry, &parts).await?;
                Ok(sign_entries_from_parts(
                    &resolved,
                    &request.signing_key,
                    request.identity.as_deref(),
                ))
            }
        })
        .await?;
    Ok(per_request.into_iter().flatten().collect())
}

/// Resolve `requests` and run them through the chunked signing flow.
pub async fn sign_requests<R, B, S>(
    registry: &Arc<R>,
    backend: &Arc<B>,
    store: &Arc<S>,
    requests: Vec<SignRequest>,
    options: SignOptions,
    executors: Executors,
) -> Result<SignOutcome>
where
    R: Registry + 'static,
    B: SignerBackend + 'static,
    S: SignatureStore + 'static,
{
    let entries = resolve_entries(registry, requests, executors.preprocess).await?;
    info!("Signing {} entries", entries.len());
    sign_entries(
        Arc::clone(backend),
        Arc::clone(store),
        entries,
        options,
        executors.signing,
    )
    .await
}

/// Sign every live tag of the given repositories.
///
/// Repositories come inline or from a one-per-line file; each repo's tags
/// fan out against `identity_bases` as in
/// [`repo_sign_requests`].
#[allow(clippy::too_many_arguments)]
pub async fn sign_repos<R, B, S>(
    registry: &Arc<R>,
    backend: &Arc<B>,
    store: &Arc<S>,
    repos: &[String],
    repo_file: Option<&Path>,
    identity_bases: &[String],
    signing_key: &str,
    options: SignOptions,
    executors: Executors,
) -> Result<SignOutcome>
where
    R: Registry + 'static,
    B: SignerBackend + 'static,
    S: SignatureStore + 'static,
{
    let repos = decide_repos(repos, repo_file).await?;
    let mut requests = Vec::new();
    for repo in &repos {
        requests.extend(repo_sign_requests(&**registry, repo, identity_bases, signing_key).await?);
    }
    info!(
        "Signing {} tag references across {} repositories",
        requests.len(),
        repos.len()
    );
    sign_requests(registry, backend, store, requests, options, executors).await
}

/// Sign every component image of a release snapshot.
///
/// Component addresses are digest-pinned, so the resulting entries carry
/// no tag-derived pull reference and no identity anchor.
pub async fn sign_snapshot<R, B, S>(
    registry: &Arc<R>,
    backend: &Arc<B>,
    store: &Arc<S>,
    snapshot: &Snapshot,
    signing_key: &str,
    options: SignOptions,
    executors: Executors,
) -> Result<SignOutcome>
where
    R: Registry + 'static,
    B: SignerBackend + 'static,
    S: SignatureStore + 'static,
{
    let requests: Vec<SignRequest> = snapshot
        .container_images()
        .map(|image| SignRequest::new(image, None, signing_key))
        .collect();
    info!(
        "Signing snapshot {:?} with {} components",
        snapshot.application,
        requests.len()
    );
    sign_requests(registry, backend, store, requests, options, executors).await
}

/// Resolve `requests`, verify every entry through both trust sources, and
/// append one report row.  The appended row is also returned.
pub async fn verify_and_report<R, L, C, K>(
    registry: &Arc<R>,
    legacy: &L,
    cosign: &C,
    sink: &K,
    requests: Vec<SignRequest>,
    options: &VerifyOptions,
    executor: Executor,
) -> Result<Vec<Cell>>
where
    R: Registry + 'static,
    L: LegacyStore + ?Sized,
    C: CosignVerifier + ?Sized,
    K: ReportSink + ?Sized,
{
    let entries = resolve_entries(registry, requests, executor).await?;
    let legacy_results = verify_legacy(legacy, &entries, &options.default_arch).await?;
    let cosign_results = verify_cosign(cosign, &entries).await?;
    let row = evaluate(&entries, &legacy_results, &cosign_results);
    sink.append(&options.range, row.clone()).await?;
    Ok(row)
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::cosign::Verdict;
    use crate::registry::MANIFEST_OCI_TYPE;
    use crate::signer::ChunkState;
    use crate::sigstore::LegacySignature;
    use crate::test::{
        manifest_body, manifest_list_body, FakeCosign, FakeLegacyStore, FakeRegistry, FakeSigner,
        MemorySignatureStore, RecordingSink,
    };

    #[tokio::test]
    async fn resolves_requests_into_per_arch_entries() {
        let registry = Arc::new(FakeRegistry::new());
        registry.put_manifest(
            "quay.io/acme/billing:v1",
            crate::registry::MANIFEST_LIST_TYPE,
            &manifest_list_body(&[
                (&format!("sha256:{:0>64}", "a"), "amd64"),
                (&format!("sha256:{:0>64}", "b"), "arm64"),
            ]),
        );

        let requests = vec![SignRequest::new(
            "quay.io/acme/billing:v1",
            Some("registry.example.com/billing:v1".to_string()),
            "release-key",
        )];
        let entries = resolve_entries(&registry, requests, Executor::Sequential)
            .await
            .unwrap();

        // the multiarch aggregate is excluded
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].arch, "amd64");
        assert_eq!(entries[1].arch, "arm64");
        assert!(entries
            .iter()
            .all(|e| e.reference.as_deref() == Some("quay.io/acme/billing:v1")));
        assert!(entries
            .iter()
            .all(|e| e.identity.as_deref() == Some("registry.example.com/billing:v1")));
    }

    #[tokio::test]
    async fn sign_flow_resolves_chunks_and_stores() {
        let registry = Arc::new(FakeRegistry::new());
        registry.put_manifest(
            "quay.io/acme/billing:v1",
            MANIFEST_OCI_TYPE,
            &manifest_body(1),
        );
        registry.put_manifest(
            "quay.io/acme/web:v2",
            MANIFEST_OCI_TYPE,
            &manifest_body(2),
        );
        let backend = Arc::new(FakeSigner::default());
        let store = Arc::new(MemorySignatureStore::default());

        let requests = vec![
            SignRequest::new("quay.io/acme/billing:v1", None, "release-key"),
            SignRequest::new("quay.io/acme/web:v2", None, "release-key"),
        ];
        let outcome = sign_requests(
            &registry,
            &backend,
            &store,
            requests,
            SignOptions {
                chunk_size: 1,
                ..SignOptions::default()
            },
            Executors {
                preprocess: Executor::Sequential,
                signing: Executor::Sequential,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            outcome.chunk_states,
            vec![ChunkState::Stored, ChunkState::Stored]
        );
        assert_eq!(backend.calls().len(), 2);
        for entry in &outcome.signed {
            assert!(store.contains(entry).await.unwrap());
        }
    }

    #[tokio::test]
    async fn repo_flow_signs_each_live_tag() {
        let registry = Arc::new(FakeRegistry::new());
        registry.put_tags("acme/billing", &["v1", "v1.sig"]);
        registry.put_manifest(
            "quay.io/acme/billing:v1",
            MANIFEST_OCI_TYPE,
            &manifest_body(1),
        );
        let backend = Arc::new(FakeSigner::default());
        let store = Arc::new(MemorySignatureStore::default());

        let outcome = sign_repos(
            &registry,
            &backend,
            &store,
            &["quay.io/acme/billing".to_string()],
            None,
            &["registry.example.com".to_string()],
            "release-key",
            SignOptions::default(),
            Executors {
                preprocess: Executor::Sequential,
                signing: Executor::Sequential,
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.signed.len(), 1);
        assert_eq!(
            outcome.signed[0].identity.as_deref(),
            Some("registry.example.com/billing:v1")
        );
    }

    #[tokio::test]
    async fn snapshot_flow_signs_components_without_identity() {
        let digest = format!("sha256:{:0>64}", "3");
        let registry = Arc::new(FakeRegistry::new());
        registry.put_manifest(
            &format!("quay.io/acme/worker@{digest}"),
            MANIFEST_OCI_TYPE,
            &manifest_body(3),
        );
        let backend = Arc::new(FakeSigner::default());
        let store = Arc::new(MemorySignatureStore::default());

        let snapshot = Snapshot::parse(&format!(
            r#"{{
                "application": "acme",
                "components": [{{
                    "name": "worker",
                    "containerImage": "quay.io/acme/worker@{digest}",
                    "repository": "quay.io/acme/worker"
                }}]
            }}"#
        ))
        .unwrap();

        let outcome = sign_snapshot(
            &registry,
            &backend,
            &store,
            &snapshot,
            "release-key",
            SignOptions::default(),
            Executors {
                preprocess: Executor::Sequential,
                signing: Executor::Sequential,
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.signed.len(), 1);
        assert_eq!(outcome.signed[0].identity, None);
        assert_eq!(outcome.signed[0].reference, None);
        // the address was digest-pinned, so the local hash replaces it
        assert_eq!(outcome.signed[0].digest, crate::resolve::hash(manifest_body(3).as_bytes()));
    }

    #[tokio::test]
    async fn verify_flow_appends_one_evaluated_row() {
        let identity = "registry.example.com/billing:v1";
        let amd64_digest = format!("sha256:{:0>64}", "a");
        let arm64_digest = format!("sha256:{:0>64}", "b");
        let registry = Arc::new(FakeRegistry::new());
        registry.put_manifest(
            "quay.io/acme/billing:v1",
            crate::registry::MANIFEST_LIST_TYPE,
            &manifest_list_body(&[(&amd64_digest, "amd64"), (&arm64_digest, "arm64")]),
        );

        // the legacy host is only consulted for the amd64 child
        let legacy = FakeLegacyStore::new();
        legacy.put(
            "billing",
            &amd64_digest,
            vec![LegacySignature::new(identity, &amd64_digest)],
        );
        let cosign = FakeCosign::new();
        cosign.put("quay.io/acme/billing:v1", Verdict::pass());
        let sink = RecordingSink::new();

        let requests = vec![SignRequest::new(
            "quay.io/acme/billing:v1",
            Some(identity.to_string()),
            "release-key",
        )];
        let row = verify_and_report(
            &registry,
            &legacy,
            &cosign,
            &sink,
            requests,
            &VerifyOptions::default(),
            Executor::Sequential,
        )
        .await
        .unwrap();

        assert_eq!(row[1..], [Cell::Number(1), Cell::Number(1)]);
        let appended = sink.rows();
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].0, DEFAULT_RANGE);
        assert_eq!(appended[0].1, row);
    }
}
