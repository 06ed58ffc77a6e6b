//! The two verification flows: legacy signature host and cosign.
//!
//! Both produce per-entry [`Verification`] records rather than failing the
//! run; the evaluator turns the records into report cells.

use std::collections::HashMap;

use log::info;

use crate::cosign::{CosignVerifier, Verdict};
use crate::error::Result;
use crate::sign::SignEntry;
use crate::sigstore::LegacyStore;

/// Platform arch whose entries the legacy host publishes signatures for.
pub const DEFAULT_ARCH: &str = "amd64";

/// One entry's verification outcome from one source.
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub entry: SignEntry,
    pub verified: bool,
    pub diagnostics: Option<String>,
}

/// The host's image path for an identity: the part after the registry,
/// with any tag removed.
fn image_from_identity(identity: &str) -> &str {
    let path = identity.split_once('/').map_or(identity, |(_, rest)| rest);
    path.split_once(':').map_or(path, |(image, _)| image)
}

/// Verify `entries` against the legacy signature host.
///
/// Only entries for `default_arch` participate; other architectures are
/// not recorded at all.  An entry is verified when any published claim
/// names its identity.
pub async fn verify_legacy<S: LegacyStore + ?Sized>(
    store: &S,
    entries: &[SignEntry],
    default_arch: &str,
) -> Result<Vec<Verification>> {
    let mut results = Vec::new();
    for entry in entries {
        if entry.arch != default_arch {
            continue;
        }
        let Some(identity) = entry.identity.as_deref() else {
            results.push(Verification {
                entry: entry.clone(),
                verified: false,
                diagnostics: Some("entry has no identity".to_string()),
            });
            continue;
        };
        let image = image_from_identity(identity);
        info!("Legacy: verifying {identity} at {}", entry.digest);
        let signatures = store.signatures(image, &entry.digest).await?;
        let verified = signatures
            .iter()
            .any(|signature| signature.critical.identity.docker_reference == identity);
        results.push(Verification {
            entry: entry.clone(),
            verified,
            diagnostics: None,
        });
    }
    Ok(results)
}

/// Verify `entries` through cosign, one invocation per distinct pull
/// reference.
///
/// References are deduplicated by first appearance and every entry sharing
/// a reference receives that reference's verdict.
pub async fn verify_cosign<C: CosignVerifier + ?Sized>(
    cosign: &C,
    entries: &[SignEntry],
) -> Result<Vec<Verification>> {
    let mut verdicts: HashMap<String, Verdict> = HashMap::new();
    let mut results = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(reference) = entry.reference.as_deref() else {
            results.push(Verification {
                entry: entry.clone(),
                verified: false,
                diagnostics: Some("entry has no pull reference".to_string()),
            });
            continue;
        };
        let verdict = match verdicts.get(reference) {
            Some(verdict) => verdict.clone(),
            None => {
                info!("Cosign: verifying {reference}");
                let verdict = cosign.verify(reference).await?;
                verdicts.insert(reference.to_string(), verdict.clone());
                verdict
            }
        };
        results.push(Verification {
            entry: entry.clone(),
            verified: verdict.verified,
            diagnostics: verdict.diagnostics,
        });
    }
    Ok(results)
}
