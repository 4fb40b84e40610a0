use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub limits: LimitsConfig,
    pub storage: StorageConfig,
    pub sandbox: SandboxConfig,
    pub attestation: AttestationConfig,
}

/// Admission control, retention and archive policy caps.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    /// Jobs allowed in `pending`/`running` at the same time
    pub max_concurrent_jobs: usize,
    /// Jobs tracked in the table, terminal ones included
    pub max_tracked_jobs: usize,
    /// Age after which the sweep evicts a job regardless of state
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// Archive bomb defenses
    pub max_entries: usize,
    pub max_unpacked_bytes: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Uploaded package bytes, deleted once extraction finishes
    pub upload_root: PathBuf,
    /// Per-job extraction directories
    pub work_root: PathBuf,
    /// One JSON file per terminal job
    pub results_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container CLI used as the sandbox runtime
    pub runtime_binary: String,
    pub build_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: u32,
    /// Size of the writable /tmp scratch area
    pub tmpfs_mb: u64,
    /// Captured stdout/stderr are truncated to this many bytes each
    pub max_output_bytes: usize,
    /// Allowlisted base environments: identifier → pinned image reference
    pub environments: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AttestationConfig {
    /// Set to false to skip the oracle entirely (always `none` attestations)
    pub enabled: bool,
    /// Well-known local channel of the TEE quote service
    pub socket_path: PathBuf,
    pub timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            max_tracked_jobs: 100,
            retention_secs: 3600,
            sweep_interval_secs: 60,
            max_entries: 1000,
            max_unpacked_bytes: 100 * 1024 * 1024,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_root: PathBuf::from("./data/uploads"),
            work_root: PathBuf::from("./data/work"),
            results_dir: PathBuf::from("./data/results"),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime_binary: "docker".to_string(),
            build_timeout_secs: 300,
            run_timeout_secs: 60,
            memory_mb: 512,
            cpus: 1.0,
            pids_limit: 64,
            tmpfs_mb: 64,
            max_output_bytes: 64 * 1024,
            environments: default_environments(),
        }
    }
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: PathBuf::from("/var/run/tappd.sock"),
            timeout_secs: 5,
        }
    }
}

/// Base environments known to be safe. Pinned to explicit tags;
/// deployments should override these with `@sha256:` digests.
fn default_environments() -> BTreeMap<String, String> {
    [
        ("alpine", "alpine:3.20"),
        ("python", "python:3.12-alpine"),
        ("node", "node:20-alpine"),
        ("debian", "debian:12-slim"),
    ]
    .into_iter()
    .map(|(id, image)| (id.to_string(), image.to_string()))
    .collect()
}

impl LimitsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        // A zero interval would make tokio::time::interval panic
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl SandboxConfig {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${VERIFIER_DATA_DIR}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that would disable a safety limit.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.limits.max_concurrent_jobs == 0 {
            anyhow::bail!("limits.max_concurrent_jobs must be at least 1");
        }
        if self.limits.max_tracked_jobs < self.limits.max_concurrent_jobs {
            anyhow::bail!("limits.max_tracked_jobs must be >= limits.max_concurrent_jobs");
        }
        if self.sandbox.run_timeout_secs == 0 || self.sandbox.build_timeout_secs == 0 {
            anyhow::bail!("sandbox timeouts must be non-zero");
        }
        if self.sandbox.run_timeout_secs > self.sandbox.build_timeout_secs {
            anyhow::bail!("sandbox.run_timeout_secs must not exceed sandbox.build_timeout_secs");
        }
        if self.sandbox.environments.is_empty() {
            anyhow::bail!("sandbox.environments must list at least one base environment");
        }
        Ok(())
    }
}
