//! Chunked signing against a pluggable backend and signature store.
//!
//! Entries are split into fixed-size chunks and each chunk moves through a
//! small state machine: already-covered entries are filtered out against
//! the store, the remainder is submitted to the backend in one call, and
//! the backend's response is persisted together with the entry keys it
//! covers.  A chunk whose submission fails is fatal for the whole run;
//! results persisted for earlier chunks are left in place, which is what
//! makes a rerun after a partial failure cheap.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{PipelineError, Result};
use crate::executor::Executor;
use crate::reference::ContainerParts;
use crate::sign::{chunk_entries, SignEntry};

/// A signing backend: takes one chunk of entries, returns an opaque
/// backend response describing the produced signatures.
#[async_trait]
pub trait SignerBackend: Send + Sync {
    /// `task_id` correlates the chunks of one logical signing job on the
    /// backend side.
    async fn sign(&self, entries: &[SignEntry], task_id: u64) -> Result<serde_json::Value>;
}

/// Durable record of which entries have been signed.
#[async_trait]
pub trait SignatureStore: Send + Sync {
    async fn contains(&self, entry: &SignEntry) -> Result<bool>;

    /// Persist `response` as covering exactly `entries`.
    async fn store(&self, entries: &[SignEntry], response: &serde_json::Value) -> Result<()>;
}

/// Final state of one chunk after a signing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Filtering left nothing to sign; the backend was not called.
    Skipped,
    /// Dry run: the backend call was withheld and nothing was stored.
    DryRun,
    /// Signed and the backend response persisted.
    Stored,
}

/// Knobs for one signing run.
#[derive(Debug, Clone)]
pub struct SignOptions {
    pub chunk_size: usize,
    pub task_id: u64,
    pub dry_run: bool,
}

pub const DEFAULT_CHUNK_SIZE: usize = 50;
pub const DEFAULT_TASK_ID: u64 = 1;

impl Default for SignOptions {
    fn default() -> Self {
        SignOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            task_id: DEFAULT_TASK_ID,
            dry_run: false,
        }
    }
}

/// Outcome of a signing run.
#[derive(Debug, Default)]
pub struct SignOutcome {
    /// Final state of each chunk, in submission order.
    pub chunk_states: Vec<ChunkState>,
    /// Entries that were submitted (or, on a dry run, would have been).
    pub signed: Vec<SignEntry>,
}

/// Run `entries` through the chunked sign-and-store flow.
///
/// Chunks are dispatched via `executor`; any chunk failure aborts the run
/// with that chunk's error.
pub async fn sign_entries<B, S>(
    backend: std::sync::Arc<B>,
    store: std::sync::Arc<S>,
    entries: Vec<SignEntry>,
    options: SignOptions,
    executor: Executor,
) -> Result<SignOutcome>
where
    B: SignerBackend + 'static,
    S: SignatureStore + 'static,
{
    let chunks = chunk_entries(&entries, options.chunk_size);
    let total = chunks.len();
    let numbered: Vec<(usize, Vec<SignEntry>)> = chunks.into_iter().enumerate().collect();

    let results = executor
        .try_map(numbered, move |(index, chunk)| {
            let backend = std::sync::Arc::clone(&backend);
            let store = std::sync::Arc::clone(&store);
            let options = options.clone();
            async move { sign_chunk(&*backend, &*store, index, total, chunk, &options).await }
        })
        .await?;

    let mut outcome = SignOutcome::default();
    for (state, submitted) in results {
        outcome.chunk_states.push(state);
        outcome.signed.extend(submitted);
    }
    Ok(outcome)
}

async fn sign_chunk<B: SignerBackend + ?Sized, S: SignatureStore + ?Sized>(
    backend: &B,
    store: &S,
    index: usize,
    total: usize,
    chunk: Vec<SignEntry>,
    options: &SignOptions,
) -> Result<(ChunkState, Vec<SignEntry>)> {
    let mut remaining = Vec::with_capacity(chunk.len());
    for entry in chunk {
        if store.contains(&entry).await? {
            debug!(
                "Already signed: {} {} ({})",
                entry.repo, entry.digest, entry.arch
            );
        } else {
            remaining.push(entry);
        }
    }

    if remaining.is_empty() {
        info!("Chunk {}/{total}: nothing left to sign", index + 1);
        return Ok((ChunkState::Skipped, remaining));
    }

    if options.dry_run {
        for entry in &remaining {
            info!(
                "Would sign {} {} ({}) as {}",
                entry.repo,
                entry.digest,
                entry.arch,
                entry.identity.as_deref().unwrap_or("<no identity>")
            );
        }
        return Ok((ChunkState::DryRun, remaining));
    }

    info!(
        "Chunk {}/{total}: signing {} entries (task {})",
        index + 1,
        remaining.len(),
        options.task_id
    );
    let response = backend.sign(&remaining, options.task_id).await?;
    store.store(&remaining, &response).await?;
    Ok((ChunkState::Stored, remaining))
}

/// Backend that shells out to the cosign binary, once per entry.
#[derive(Debug, Clone)]
pub struct CosignSigner {
    binary: PathBuf,
    registry: String,
}

impl CosignSigner {
    pub fn new(registry: impl Into<String>) -> Self {
        CosignSigner {
            binary: PathBuf::from("cosign"),
            registry: registry.into(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// The digest-pinned address cosign is pointed at.  An entry with a
    /// pull reference keeps that reference's registry; digest-form entries
    /// carry none and fall back to the configured registry host.
    fn sign_target(&self, entry: &SignEntry) -> Result<String> {
        match entry.reference.as_deref() {
            Some(reference) => {
                let parts = ContainerParts::parse(reference)?;
                Ok(format!("{}/{}@{}", parts.registry, parts.image, entry.digest))
            }
            None => Ok(format!("{}/{}@{}", self.registry, entry.repo, entry.digest)),
        }
    }
}

#[async_trait]
impl SignerBackend for CosignSigner {
    async fn sign(&self, entries: &[SignEntry], task_id: u64) -> Result<serde_json::Value> {
        let mut signed = Vec::with_capacity(entries.len());
        for entry in entries {
            let target = self.sign_target(entry)?;
            debug!("cosign sign {target} (task {task_id})");
            let output = Command::new(&self.binary)
                .arg("sign")
                .arg("--key")
                .arg(&entry.signing_key)
                .arg(&target)
                .env("COSIGN_YES", "true") // never prompt
                .stdin(Stdio::null())
                .output()
                .await?;
            if !output.status.success() {
                return Err(PipelineError::Signing(format!(
                    "cosign sign {target} failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            signed.push(target);
        }
        Ok(serde_json::json!({
            "signer_result": { "status": "ok" },
            "signed": signed,
        }))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredBatch {
    entries: Vec<String>,
    result: serde_json::Value,
}

/// Append-only JSON-lines signature store.
///
/// Each line records one backend response together with the keys of the
/// entries it covers.  `contains` answers from an in-memory key index
/// loaded when the store is opened.
#[derive(Debug)]
pub struct FileSignatureStore {
    path: PathBuf,
    known: Mutex<HashSet<String>>,
}

impl FileSignatureStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut known = HashSet::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    let batch: StoredBatch = serde_json::from_str(line)?;
                    known.extend(batch.entries);
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        Ok(FileSignatureStore {
            path,
            known: Mutex::new(known),
        })
    }
}

#[async_trait]
impl SignatureStore for FileSignatureStore {
    async fn contains(&self, entry: &SignEntry) -> Result<bool> {
        Ok(self.known.lock().await.contains(&entry.key()))
    }

    async fn store(&self, entries: &[SignEntry], response: &serde_json::Value) -> Result<()> {
        let keys: Vec<String> = entries.iter().map(SignEntry::key).collect();
        let batch = StoredBatch {
            entries: keys.clone(),
            result: response.clone(),
        };
        let mut line = serde_json::to_string(&batch)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        self.known.lock().await.extend(keys);
        Ok(())
    }
}
