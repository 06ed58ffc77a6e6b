//! Error types for the consign library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, PipelineError>`.  Verification verdicts are deliberately *not*
//! errors: a failed `cosign verify` run is recorded as data and the pipeline
//! carries on, while the variants here abort the run.

use std::path::PathBuf;

/// Result type alias for operations that may return a PipelineError.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error types for the signing and verification pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// An image reference could not be split into registry/image/tag-or-digest.
    #[error("malformed image reference: {0}")]
    MalformedReference(String),

    /// The registry has no manifest for the requested reference.
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// The registry returned a manifest of an unusable type or encoding.
    #[error("image {reference} doesn't have a {media_type} manifest")]
    ManifestType {
        reference: String,
        media_type: String,
    },

    /// The signing backend reported a failure for a chunk.
    #[error("signing failed: {0}")]
    Signing(String),

    /// A signature payload could not be decoded.
    #[error("signature decoding failed: {0}")]
    SignatureDecode(String),

    /// No repositories were selected for signing.
    #[error("no repositories provided (list empty and no usable file)")]
    NoRepositories,

    /// A repository file could not be read.
    #[error("failed to read repository file {0}")]
    RepoFile(PathBuf),

    /// Transport-level registry failure.
    #[error("registry request failed: {0}")]
    Registry(#[from] reqwest::Error),

    /// The registry returned a response the client could not interpret.
    #[error("unexpected registry response: {0}")]
    Protocol(String),

    /// A worker task or thread failed to deliver its result.
    #[error("executor failed: {0}")]
    Executor(String),

    /// I/O error during file or subprocess operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}
