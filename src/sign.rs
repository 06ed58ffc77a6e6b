//! Sign entries: the unit of signing work.

use std::hash::{Hash, Hasher};

use crate::reference::ContainerParts;

/// One signable (image, digest, architecture) unit.
///
/// Equality and hashing cover (repo, digest, arch, identity) only: the
/// signing key is credential material and the pull reference is derived
/// addressing, so neither participates in dedup or store lookups.
#[derive(Debug, Clone)]
pub struct SignEntry {
    /// Image path within the registry, e.g. `containers/podman`.
    pub repo: String,
    /// Pull reference, only present when the source reference carried a tag.
    pub reference: Option<String>,
    pub digest: String,
    pub signing_key: String,
    pub arch: String,
    /// Reference string the signature is anchored under, which may differ
    /// from the pull reference.
    pub identity: Option<String>,
}

impl SignEntry {
    /// The identity tuple as a stable string, usable as a store key.
    pub fn key(&self) -> String {
        // a JSON array keeps a missing identity distinct from an empty one
        serde_json::json!([self.repo, self.digest, self.arch, self.identity]).to_string()
    }
}

impl PartialEq for SignEntry {
    fn eq(&self, other: &Self) -> bool {
        self.repo == other.repo
            && self.digest == other.digest
            && self.arch == other.arch
            && self.identity == other.identity
    }
}

impl Eq for SignEntry {}

impl Hash for SignEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.repo.hash(state);
        self.digest.hash(state);
        self.arch.hash(state);
        self.identity.hash(state);
    }
}

/// One pipeline input: which reference to sign, anchored under which
/// identity, with which key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub reference: String,
    pub identity: Option<String>,
    pub signing_key: String,
}

impl SignRequest {
    pub fn new(
        reference: impl Into<String>,
        identity: Option<String>,
        signing_key: impl Into<String>,
    ) -> Self {
        Self {
            reference: reference.into(),
            identity,
            signing_key: signing_key.into(),
        }
    }
}

/// Build one entry per non-aggregate digest of a resolved reference.
///
/// The `"multiarch"` aggregate is excluded: only leaf architecture
/// manifests are individually signed.  `reference` is re-derived from the
/// pull address only when the parse carried a tag.
pub fn sign_entries_from_parts(
    parts: &ContainerParts,
    signing_key: &str,
    identity: Option<&str>,
) -> Vec<SignEntry> {
    let reference = parts.reference();
    parts
        .manifests
        .iter()
        .filter(|pair| !pair.is_multiarch())
        .map(|pair| SignEntry {
            repo: parts.image.clone(),
            reference: reference.clone(),
            digest: pair.digest.clone(),
            signing_key: signing_key.to_string(),
            arch: pair.arch.clone(),
            identity: identity.map(str::to_string),
        })
        .collect()
}

/// Partition `entries` into ordered chunks of at most `chunk_size` entries
/// (sizes below 1 are treated as 1).  Every chunk but the last has exactly
/// `chunk_size` entries, and concatenating the chunks reproduces the input.
///
/// Signing is not transactionally atomic across a whole batch; bounding the
/// per-request entry count bounds how many entries are left in an ambiguous
/// signed/unsigned state when a request fails mid-way.
pub fn chunk_entries(entries: &[SignEntry], chunk_size: usize) -> Vec<Vec<SignEntry>> {
    entries
        .chunks(chunk_size.max(1))
        .map(<[SignEntry]>::to_vec)
        .collect()
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::reference::DigestArch;

    fn entry(digest: &str) -> SignEntry {
        SignEntry {
            repo: "ns/app".to_string(),
            reference: Some("quay.io/ns/app:v1".to_string()),
            digest: digest.to_string(),
            signing_key: "key1".to_string(),
            arch: "amd64".to_string(),
            identity: Some("registry.example.com/app:v1".to_string()),
        }
    }

    #[test]
    fn identity_excludes_signing_key_and_reference() {
        let a = entry("sha256:aa");
        let mut b = a.clone();
        b.signing_key = "other-key".to_string();
        b.reference = None;
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        assert_eq!(set.len(), 1);

        let mut c = entry("sha256:aa");
        c.identity = None;
        assert!(!set.contains(&c));
    }

    #[test]
    fn key_distinguishes_missing_identity_from_empty() {
        let mut a = entry("sha256:aa");
        a.identity = None;
        let mut b = entry("sha256:aa");
        b.identity = Some(String::new());
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn builder_excludes_multiarch_aggregate() {
        let parts = ContainerParts {
            registry: "quay.io".to_string(),
            image: "containers/podman".to_string(),
            tag: Some("latest".to_string()),
            manifests: vec![
                DigestArch::new("sha256:00", "amd64"),
                DigestArch::new("sha256:01", "arm64"),
                DigestArch::new("sha256:02", "arm"),
                DigestArch::new("sha256:03", "ppc64le"),
                DigestArch::new("sha256:04", "s390x"),
                DigestArch::new("sha256:05", "multiarch"),
            ],
        };

        let entries =
            sign_entries_from_parts(&parts, "key1", Some("registry.example.com/podman:latest"));
        assert_eq!(entries.len(), 5);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.repo, "containers/podman");
            assert_eq!(entry.digest, format!("sha256:{i:02}"));
            assert_eq!(entry.reference.as_deref(), Some("quay.io/containers/podman:latest"));
            assert_eq!(entry.identity.as_deref(), Some("registry.example.com/podman:latest"));
            assert_eq!(entry.signing_key, "key1");
        }
    }

    #[test]
    fn builder_leaves_reference_empty_for_digest_form() {
        let parts = ContainerParts {
            registry: "quay.io".to_string(),
            image: "ns/app".to_string(),
            tag: None,
            manifests: vec![DigestArch::new("sha256:aa", "")],
        };
        let entries = sign_entries_from_parts(&parts, "key1", None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reference, None);
        assert_eq!(entries[0].identity, None);
        assert_eq!(entries[0].arch, "");
    }

    #[test]
    fn chunker_produces_bounded_ordered_chunks() {
        // (entries, chunk size, expected chunk count)
        let cases = [
            (0usize, 3usize, 0usize),
            (1, 3, 1),
            (3, 3, 1),
            (4, 3, 2),
            (10, 3, 4),
            (10, 50, 1),
            (5, 0, 5), // size 0 is normalized to 1
        ];

        for (len, size, expected) in cases {
            let entries: Vec<_> = (0..len).map(|i| entry(&format!("sha256:{i}"))).collect();
            let chunks = chunk_entries(&entries, size);
            assert_eq!(chunks.len(), expected, "len={len} size={size}");

            let bound = size.max(1);
            for chunk in &chunks[..chunks.len().saturating_sub(1)] {
                assert_eq!(chunk.len(), bound);
            }
            if let Some(last) = chunks.last() {
                assert!(!last.is_empty() && last.len() <= bound);
            }

            let concatenated: Vec<_> = chunks.into_iter().flatten().collect();
            assert_eq!(concatenated, entries);
        }
    }
}
