//! Attestation of verification results.
//!
//! The fields that matter to the claim are serialized in a fixed order
//! and hashed with SHA-256. When a TEE quote service is reachable over
//! its local socket, the digest is sent as report data and the returned
//! quote is attached (`verifier_kind = hardware`). Otherwise the
//! attestation is explicitly labeled `none` and carries no quote.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::sandbox::TestResult;

/// Quote endpoint of the local TEE service.
const QUOTE_PATH: &str = "/prpc/Tappd.TdxQuote?json";

/// Maximum accepted response size from the oracle.
const MAX_RESPONSE_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerifierKind {
    /// Quote signed by trusted hardware
    Hardware,
    /// Digest only, self-reported
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attestation {
    /// Hex SHA-256 of the canonical claim
    pub result_hash: String,
    /// Base64 quote bytes; present iff `verifier_kind == hardware`
    pub quote: Option<String>,
    pub verifier_kind: VerifierKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Attestation {
    pub fn is_hardware_backed(&self) -> bool {
        self.verifier_kind == VerifierKind::Hardware && self.quote.is_some()
    }
}

/// Identity of the verified package.
#[derive(Debug, Clone)]
pub struct Subject<'a> {
    pub job_id: &'a str,
    pub package: &'a str,
    pub version: &'a str,
}

/// Canonical claim. Field order is the serialization order.
#[derive(Serialize)]
struct Claim<'a> {
    job_id: &'a str,
    package: &'a str,
    version: &'a str,
    passed: bool,
    exit_code: i32,
    duration_ms: u64,
}

/// Canonical bytes of the claim over `result`.
pub fn canonical_claim(subject: &Subject<'_>, result: &TestResult) -> Vec<u8> {
    let claim = Claim {
        job_id: subject.job_id,
        package: subject.package,
        version: subject.version,
        passed: result.passed,
        exit_code: result.exit_code,
        duration_ms: result.duration_ms,
    };
    // A struct of strings, bools and integers always serializes
    serde_json::to_vec(&claim).unwrap_or_default()
}

pub fn result_digest(subject: &Subject<'_>, result: &TestResult) -> [u8; 32] {
    Sha256::digest(canonical_claim(subject, result)).into()
}

/// External hardware-backed signer.
#[async_trait]
pub trait TeeOracle: Send + Sync {
    /// Returns a quote over `digest`. Errors mean "unavailable".
    async fn get_quote(&self, digest: &[u8]) -> Result<Vec<u8>>;

    fn description(&self) -> String;
}

/// TEE quote service reached over HTTP on a local unix socket.
pub struct UnixSocketOracle {
    path: PathBuf,
    timeout: Duration,
}

#[derive(Deserialize)]
struct QuoteResponse {
    quote: String,
}

impl UnixSocketOracle {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    #[cfg(unix)]
    async fn request(&self, digest: &[u8]) -> Result<Vec<u8>> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let body = serde_json::json!({ "report_data": hex::encode(digest) }).to_string();
        let request = format!(
            "POST {QUOTE_PATH} HTTP/1.0\r\n\
             Host: localhost\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {body}",
            body.len()
        );

        let mut stream = tokio::net::UnixStream::connect(&self.path).await?;
        stream.write_all(request.as_bytes()).await?;

        let mut response = Vec::new();
        (&mut stream)
            .take(MAX_RESPONSE_SIZE as u64 + 1)
            .read_to_end(&mut response)
            .await?;
        if response.len() > MAX_RESPONSE_SIZE {
            bail!("oracle response exceeds {MAX_RESPONSE_SIZE} bytes");
        }
        parse_quote_response(&response)
    }

    #[cfg(not(unix))]
    async fn request(&self, _digest: &[u8]) -> Result<Vec<u8>> {
        bail!("unix sockets are not supported on this platform")
    }
}

#[async_trait]
impl TeeOracle for UnixSocketOracle {
    async fn get_quote(&self, digest: &[u8]) -> Result<Vec<u8>> {
        if !self.path.exists() {
            bail!("quote service socket {} not present", self.path.display());
        }
        tokio::time::timeout(self.timeout, self.request(digest))
            .await
            .map_err(|_| anyhow!("quote service timed out after {}s", self.timeout.as_secs()))?
    }

    fn description(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

/// Extracts the hex quote from a raw HTTP response.
fn parse_quote_response(response: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(response)?;
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| anyhow!("malformed HTTP response from quote service"))?;
    let status = head.lines().next().unwrap_or_default();
    if status.split_whitespace().nth(1) != Some("200") {
        bail!("quote service returned '{status}'");
    }
    let parsed: QuoteResponse = serde_json::from_str(body.trim())?;
    let quote = hex::decode(parsed.quote.trim_start_matches("0x"))?;
    if quote.is_empty() {
        bail!("quote service returned an empty quote");
    }
    Ok(quote)
}

pub struct AttestationGenerator {
    oracle: Option<Arc<dyn TeeOracle>>,
}

impl AttestationGenerator {
    pub fn new(oracle: Option<Arc<dyn TeeOracle>>) -> Self {
        if let Some(ref oracle) = oracle {
            info!("Attestation oracle: {}", oracle.description());
        } else {
            info!("Attestation oracle: disabled (attestations will be unsigned)");
        }
        Self { oracle }
    }

    /// Produces an attestation. Never fails: an unavailable oracle only
    /// downgrades the result to `verifier_kind = none`.
    pub async fn attest(&self, subject: &Subject<'_>, result: &TestResult) -> Attestation {
        let digest = result_digest(subject, result);
        let result_hash = hex::encode(digest);

        let Some(oracle) = &self.oracle else {
            return unsigned(result_hash, "no TEE oracle configured".to_string());
        };

        match oracle.get_quote(&digest).await {
            Ok(quote) => {
                debug!("Hardware quote obtained for job {} ({} bytes)", subject.job_id, quote.len());
                Attestation {
                    result_hash,
                    quote: Some(base64::engine::general_purpose::STANDARD.encode(&quote)),
                    verifier_kind: VerifierKind::Hardware,
                    note: None,
                    created_at: Utc::now(),
                }
            }
            Err(e) => {
                warn!("TEE oracle unavailable for job {}: {e}", subject.job_id);
                unsigned(
                    result_hash,
                    format!("hardware attestation unavailable ({e}); digest is not signed"),
                )
            }
        }
    }
}

fn unsigned(result_hash: String, note: String) -> Attestation {
    Attestation {
        result_hash,
        quote: None,
        verifier_kind: VerifierKind::None,
        note: Some(note),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub struct FixedOracle(pub Vec<u8>);

    #[async_trait]
    impl TeeOracle for FixedOracle {
        async fn get_quote(&self, digest: &[u8]) -> Result<Vec<u8>> {
            let mut quote = self.0.clone();
            quote.extend_from_slice(digest);
            Ok(quote)
        }

        fn description(&self) -> String {
            "fixed".to_string()
        }
    }

    pub struct DownOracle;

    #[async_trait]
    impl TeeOracle for DownOracle {
        async fn get_quote(&self, _digest: &[u8]) -> Result<Vec<u8>> {
            bail!("connection refused")
        }

        fn description(&self) -> String {
            "down".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn result(passed: bool) -> TestResult {
        TestResult {
            passed,
            exit_code: if passed { 0 } else { 1 },
            stdout: "ok".to_string(),
            stderr: String::new(),
            duration_ms: 1500,
            timed_out: false,
        }
    }

    fn subject() -> Subject<'static> {
        Subject {
            job_id: "job-1",
            package: "t",
            version: "1.0.0",
        }
    }

    #[test]
    fn test_canonical_claim_field_order() {
        let claim = String::from_utf8(canonical_claim(&subject(), &result(true))).unwrap();
        assert_eq!(
            claim,
            r#"{"job_id":"job-1","package":"t","version":"1.0.0","passed":true,"exit_code":0,"duration_ms":1500}"#
        );
    }

    #[test]
    fn test_digest_ignores_output_but_binds_outcome() {
        let mut noisy = result(true);
        noisy.stdout = "different output".to_string();
        assert_eq!(
            result_digest(&subject(), &result(true)),
            result_digest(&subject(), &noisy)
        );
        assert_ne!(
            result_digest(&subject(), &result(true)),
            result_digest(&subject(), &result(false))
        );
    }

    #[tokio::test]
    async fn test_hardware_attestation() {
        let generator = AttestationGenerator::new(Some(Arc::new(FixedOracle(vec![0xAA]))));
        let attestation = generator.attest(&subject(), &result(true)).await;

        assert_eq!(attestation.verifier_kind, VerifierKind::Hardware);
        assert!(attestation.is_hardware_backed());
        assert!(attestation.note.is_none());
        let quote = base64::engine::general_purpose::STANDARD
            .decode(attestation.quote.unwrap())
            .unwrap();
        assert_eq!(quote[0], 0xAA);
        assert_eq!(&quote[1..], &result_digest(&subject(), &result(true)));
    }

    #[tokio::test]
    async fn test_oracle_down_degrades_to_none() {
        let generator = AttestationGenerator::new(Some(Arc::new(DownOracle)));
        let attestation = generator.attest(&subject(), &result(true)).await;

        assert_eq!(attestation.verifier_kind, VerifierKind::None);
        assert!(attestation.quote.is_none());
        assert!(!attestation.is_hardware_backed());
        assert!(attestation.note.unwrap().contains("connection refused"));
        assert_eq!(attestation.result_hash.len(), 64);
    }

    #[tokio::test]
    async fn test_no_oracle_is_none() {
        let generator = AttestationGenerator::new(None);
        let attestation = generator.attest(&subject(), &result(false)).await;
        assert_eq!(attestation.verifier_kind, VerifierKind::None);
        assert!(attestation.quote.is_none());
    }

    #[test]
    fn test_serialized_none_has_null_quote() {
        let attestation = unsigned("ab".to_string(), "n/a".to_string());
        let json = serde_json::to_value(&attestation).unwrap();
        assert_eq!(json["verifier_kind"], "none");
        assert!(json["quote"].is_null());
    }

    #[tokio::test]
    async fn test_unix_oracle_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = UnixSocketOracle::new(dir.path().join("tappd.sock"), Duration::from_secs(1));
        let err = oracle.get_quote(&[0u8; 32]).await.unwrap_err();
        assert!(err.to_string().contains("not present"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_oracle_round_trip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tappd.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            let body = r#"{"quote":"deadbeef"}"#;
            let response = format!(
                "HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            request
        });

        let oracle = UnixSocketOracle::new(&path, Duration::from_secs(5));
        let quote = oracle.get_quote(&[1u8; 32]).await.unwrap();
        assert_eq!(quote, vec![0xde, 0xad, 0xbe, 0xef]);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /prpc/Tappd.TdxQuote?json"));
        assert!(request.contains(&hex::encode([1u8; 32])));
    }

    #[test]
    fn test_parse_quote_response_rejects_errors() {
        assert!(parse_quote_response(b"HTTP/1.0 500 Internal\r\n\r\n{}").is_err());
        assert!(parse_quote_response(b"garbage").is_err());
        assert!(parse_quote_response(b"HTTP/1.0 200 OK\r\n\r\n{\"quote\":\"\"}").is_err());
        assert_eq!(
            parse_quote_response(b"HTTP/1.0 200 OK\r\n\r\n{\"quote\":\"0x0102\"}").unwrap(),
            vec![1, 2]
        );
    }
}
