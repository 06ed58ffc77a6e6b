//! Signature verification through the cosign binary.
//!
//! Verification is a per-reference verdict, not an error: a reference that
//! fails to verify is ordinary data for the report, and the tool's output
//! is kept as the diagnostic.  Only infrastructure problems (the binary
//! cannot be spawned) surface as errors.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::error::Result;

pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(120);

/// What one verification attempt concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub verified: bool,
    pub diagnostics: Option<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Verdict {
            verified: true,
            diagnostics: None,
        }
    }

    /// An unverified verdict; empty diagnostics are dropped.
    pub fn fail(diagnostics: impl Into<String>) -> Self {
        let diagnostics = diagnostics.into();
        Verdict {
            verified: false,
            diagnostics: (!diagnostics.is_empty()).then_some(diagnostics),
        }
    }
}

/// Verifies one pull reference.
#[async_trait]
pub trait CosignVerifier: Send + Sync {
    async fn verify(&self, reference: &str) -> Result<Verdict>;
}

/// [`CosignVerifier`] shelling out to the cosign binary with a fixed
/// public key.
#[derive(Debug, Clone)]
pub struct CosignClient {
    binary: PathBuf,
    key: PathBuf,
    tlog_public_key: Option<PathBuf>,
    timeout: Duration,
}

impl CosignClient {
    pub fn new(key: impl Into<PathBuf>) -> Self {
        CosignClient {
            binary: PathBuf::from("cosign"),
            key: key.into(),
            tlog_public_key: None,
            timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Trust an alternative transparency log key.  The key is handed to
    /// the child process only; our own environment is left alone.
    pub fn with_tlog_public_key(mut self, key: impl Into<PathBuf>) -> Self {
        self.tlog_public_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CosignVerifier for CosignClient {
    async fn verify(&self, reference: &str) -> Result<Verdict> {
        let mut command = Command::new(&self.binary);
        command
            .arg("verify")
            .arg("--key")
            .arg(&self.key)
            .arg(reference)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(tlog_key) = &self.tlog_public_key {
            command.env("SIGSTORE_REKOR_PUBLIC_KEY", tlog_key);
        }

        debug!("cosign verify {reference}");
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(output) => output?,
            // dropping the unfinished future kills the child
            Err(_) => {
                return Ok(Verdict::fail(format!(
                    "cosign verify {reference} timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };

        if output.status.success() {
            return Ok(Verdict::pass());
        }
        let mut diagnostics = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            if !diagnostics.is_empty() {
                diagnostics.push('\n');
            }
            diagnostics.push_str(stderr);
        }
        Ok(Verdict::fail(diagnostics))
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn fail_drops_empty_diagnostics() {
        assert_eq!(Verdict::fail("").diagnostics, None);
        assert_eq!(
            Verdict::fail("no matching signatures").diagnostics,
            Some("no matching signatures".to_string())
        );
        assert!(Verdict::pass().verified);
    }

    #[test]
    fn builder_defaults() {
        let client = CosignClient::new("/etc/keys/release.pub");
        assert_eq!(client.binary, PathBuf::from("cosign"));
        assert_eq!(client.timeout, DEFAULT_VERIFY_TIMEOUT);
        assert_eq!(client.tlog_public_key, None);

        let client = client
            .with_binary("/usr/local/bin/cosign")
            .with_tlog_public_key("/etc/keys/tlog.pub")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(client.binary, PathBuf::from("/usr/local/bin/cosign"));
        assert_eq!(client.timeout, Duration::from_secs(5));
        assert_eq!(
            client.tlog_public_key,
            Some(PathBuf::from("/etc/keys/tlog.pub"))
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_verdict_not_an_error() {
        // `sh verify --key ...` exits nonzero without doing anything
        let client = CosignClient::new("/dev/null").with_binary("sh");
        let verdict = client
            .verify("quay.io/containers/podman:latest")
            .await
            .unwrap();
        assert!(!verdict.verified);
    }

    #[tokio::test]
    async fn zero_exit_verifies() {
        let client = CosignClient::new("/dev/null").with_binary("true");
        let verdict = client
            .verify("quay.io/containers/podman:latest")
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::pass());
    }

    #[tokio::test]
    async fn timeout_is_a_verdict_and_kills_the_child() {
        // `yes` echoes its arguments forever and only stops when killed
        let client = CosignClient::new("/dev/null")
            .with_binary("yes")
            .with_timeout(Duration::from_millis(50));
        let verdict = client
            .verify("quay.io/containers/podman:latest")
            .await
            .unwrap();
        assert!(!verdict.verified);
        assert!(verdict.diagnostics.unwrap().contains("timed out"));
    }
}
