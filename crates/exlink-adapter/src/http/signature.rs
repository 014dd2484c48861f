/*
[INPUT]:  Request path, nonce and encoded body
[OUTPUT]: API-Sign header value from an external signer
[POS]:    HTTP layer - request signing seam for private endpoints
[UPDATE]: When adding signer backends or changing the signing payload
*/

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::http::{ExchangeError, Result};

/// Produces the signature header for a private REST request.
///
/// The algorithm lives outside this crate; implementations wrap whatever
/// holds the API secret (HSM, sidecar process, test double).
#[async_trait]
pub trait RequestSigner: Send + Sync {
    async fn sign(&self, path: &str, nonce: u64, body: &str) -> Result<String>;
}

/// Mock signer for testing
#[derive(Debug, Clone)]
pub struct MockRequestSigner {
    signature: String,
}

impl MockRequestSigner {
    pub fn new(signature: &str) -> Self {
        Self {
            signature: signature.to_string(),
        }
    }
}

#[async_trait]
impl RequestSigner for MockRequestSigner {
    async fn sign(&self, _path: &str, _nonce: u64, _body: &str) -> Result<String> {
        Ok(self.signature.clone())
    }
}

/// External signer process invoked once per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerCommandConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_signer_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_signer_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Serialize)]
struct SignPayload<'a> {
    path: &'a str,
    nonce: u64,
    body: &'a str,
}

/// Writes `{"path","nonce","body"}` to the program's stdin and reads the
/// signature from its stdout.
#[derive(Debug, Clone)]
pub struct CommandSigner {
    config: SignerCommandConfig,
}

impl CommandSigner {
    pub fn new(config: SignerCommandConfig) -> Self {
        Self { config }
    }

    async fn run(&self, payload: Vec<u8>) -> Result<String> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExchangeError::Config(format!(
                "signer exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let signature = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if signature.is_empty() {
            return Err(ExchangeError::Config(
                "signer produced an empty signature".to_string(),
            ));
        }
        Ok(signature)
    }
}

#[async_trait]
impl RequestSigner for CommandSigner {
    async fn sign(&self, path: &str, nonce: u64, body: &str) -> Result<String> {
        let payload = serde_json::to_vec(&SignPayload { path, nonce, body })?;
        let timeout = Duration::from_millis(self.config.timeout_ms);
        debug!(path, nonce, program = %self.config.program.display(), "invoking external signer");

        tokio::time::timeout(timeout, self.run(payload))
            .await
            .map_err(|_| ExchangeError::Timeout {
                duration_ms: self.config.timeout_ms,
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_signer() {
        let signer = MockRequestSigner::new("mock-signature");
        let signature = signer.sign("/0/private/BalanceEx", 42, "{}").await.unwrap();
        assert_eq!(signature, "mock-signature");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_signer_reads_stdout() {
        let signer = CommandSigner::new(SignerCommandConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "cat >/dev/null; echo sig-123".to_string()],
            timeout_ms: 5_000,
        });

        let signature = signer.sign("/0/private/AddOrder", 7, "{}").await.unwrap();
        assert_eq!(signature, "sig-123");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_signer_surfaces_failures() {
        let signer = CommandSigner::new(SignerCommandConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "cat >/dev/null; echo boom >&2; exit 3".to_string()],
            timeout_ms: 5_000,
        });

        let err = signer.sign("/0/private/AddOrder", 7, "{}").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Config(message) if message.contains("boom")));
    }
}
