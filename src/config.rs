//! Configuration parsing.
//!
//! Configuration is TOML with every section and field optional; defaults
//! reproduce the stock pipeline behavior.  A typical file:
//!
//! ```toml
//! [registry]
//! host = "quay.io"
//!
//! [signing]
//! chunk_size = 50
//! store_path = "signatures.jsonl"
//!
//! [verify]
//! sigstore_base_url = "https://sigs.example.com/content/sigstore/"
//! default_arch = "amd64"
//! timeout_secs = 120
//!
//! [executor]
//! kind = "tasks"
//! pool_size = 10
//!
//! [report]
//! range = "Data!A3"
//! path = "report.jsonl"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::cosign::{CosignClient, DEFAULT_VERIFY_TIMEOUT};
use crate::executor::{Executor, DEFAULT_POOL_SIZE};
use crate::pipeline::{Executors, VerifyOptions};
use crate::report::DEFAULT_RANGE;
use crate::signer::{DEFAULT_CHUNK_SIZE, DEFAULT_TASK_ID};
use crate::verify::DEFAULT_ARCH;

fn default_host() -> String {
    "quay.io".to_string()
}

/// Registry endpoint and optional basic credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            host: default_host(),
            username: None,
            password: None,
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_task_id() -> u64 {
    DEFAULT_TASK_ID
}

fn default_store_path() -> PathBuf {
    PathBuf::from("signatures.jsonl")
}

fn default_cosign_binary() -> PathBuf {
    PathBuf::from("cosign")
}

/// Signing flow settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SigningConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_task_id")]
    pub task_id: u64,
    /// Where signed batches are recorded.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_cosign_binary")]
    pub binary: PathBuf,
    /// Chunk submission lane; strictly ordered unless set.
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        SigningConfig {
            chunk_size: default_chunk_size(),
            task_id: default_task_id(),
            store_path: default_store_path(),
            binary: default_cosign_binary(),
            executor: None,
        }
    }
}

fn default_arch() -> String {
    DEFAULT_ARCH.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_VERIFY_TIMEOUT.as_secs()
}

/// Verification flow settings.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyConfig {
    /// Base URL of the legacy signature host, ending with a slash.
    #[serde(default)]
    pub sigstore_base_url: String,
    /// Arch whose entries the legacy host is consulted for.
    #[serde(default = "default_arch")]
    pub default_arch: String,
    #[serde(default = "default_cosign_binary")]
    pub binary: PathBuf,
    #[serde(default)]
    pub tlog_public_key: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        VerifyConfig {
            sigstore_base_url: String::new(),
            default_arch: default_arch(),
            binary: default_cosign_binary(),
            tlog_public_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl VerifyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// A cosign client configured from this section, verifying against
    /// `public_key`.
    pub fn client(&self, public_key: impl Into<PathBuf>) -> CosignClient {
        let mut client = CosignClient::new(public_key)
            .with_binary(&self.binary)
            .with_timeout(self.timeout());
        if let Some(tlog_key) = &self.tlog_public_key {
            client = client.with_tlog_public_key(tlog_key);
        }
        client
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Sequential,
    Tasks,
    Threads,
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

/// One executor lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            kind: ExecutorKind::Tasks,
            pool_size: default_pool_size(),
        }
    }
}

impl ExecutorConfig {
    pub fn executor(&self) -> Executor {
        match self.kind {
            ExecutorKind::Sequential => Executor::Sequential,
            ExecutorKind::Tasks => Executor::Tasks {
                pool_size: self.pool_size,
            },
            ExecutorKind::Threads => Executor::Threads {
                pool_size: self.pool_size,
            },
        }
    }
}

fn default_range() -> String {
    DEFAULT_RANGE.to_string()
}

fn default_report_path() -> PathBuf {
    PathBuf::from("report.jsonl")
}

/// Report sink settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Spreadsheet-style anchor the row is appended at.
    #[serde(default = "default_range")]
    pub range: String,
    #[serde(default = "default_report_path")]
    pub path: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        ReportConfig {
            range: default_range(),
            path: default_report_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    /// Preprocessing lane (reference resolution).
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    /// Parse configuration from TOML content.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML content is invalid.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn executors(&self) -> Executors {
        Executors {
            preprocess: self.executor.executor(),
            signing: self
                .signing
                .executor
                .as_ref()
                .map_or(Executor::Sequential, ExecutorConfig::executor),
        }
    }

    pub fn verify_options(&self) -> VerifyOptions {
        VerifyOptions {
            default_arch: self.verify.default_arch.clone(),
            range: self.report.range.clone(),
        }
    }
}
