//! Sandboxed test execution.
//!
//! Isolation is delegated to an external sandbox runtime (Docker by
//! default, see [`docker`]). This module owns the policy around it:
//!
//! 1. Base environment allowlist: only pinned, known images
//! 2. Build with the setup command, network disabled, own timeout
//! 3. Single-use run with no network, read-only rootfs, no capabilities,
//!    pids / memory / cpu ceilings and a shorter timeout
//! 4. Image and instance destroyed on every path after the build attempt

pub mod docker;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SandboxConfig;
use crate::error::{Result, VerifyError};
use crate::sanitize::SafeCommand;

pub use docker::DockerRuntime;

/// Exit code recorded when a phase hits its wall-clock timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code recorded when the runtime itself failed before the test ran.
pub const RUNTIME_FAILURE_EXIT_CODE: i32 = -1;

/// Outcome of running a package's test command. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResult {
    pub passed: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
}

/// Resource and capability ceilings for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraints {
    /// Always true today; kept explicit so runtimes cannot forget it
    pub network_disabled: bool,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: u32,
    pub tmpfs_mb: u64,
    pub timeout: Duration,
}

/// Names of the ephemeral image and instance belonging to one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub image: String,
    pub container: String,
}

impl ImageHandle {
    pub fn for_job(job_id: &str) -> Self {
        let id = job_id.to_ascii_lowercase();
        Self {
            image: format!("skill-verifier/{id}:ephemeral"),
            container: format!("skill-verifier-{id}"),
        }
    }
}

/// Everything the runtime needs to build the ephemeral image.
#[derive(Debug)]
pub struct BuildRequest<'a> {
    pub handle: &'a ImageHandle,
    /// Pinned base image reference from the allowlist
    pub base_image: &'a str,
    /// Package files layered onto the base
    pub context: &'a Path,
    /// Private directory outside `context` for runtime bookkeeping files
    pub scratch: &'a Path,
    pub setup: Option<&'a SafeCommand>,
}

/// Raw output of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("exited with status {exit_code}")]
    Failed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("{0}")]
    Runtime(String),
}

/// The external system that builds and runs isolated environments.
///
/// All operations must honor `Constraints::network_disabled` and
/// enforce `Constraints::timeout` themselves.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn build_image(
        &self,
        request: &BuildRequest<'_>,
        constraints: &Constraints,
    ) -> std::result::Result<(), SandboxError>;

    async fn run(
        &self,
        handle: &ImageHandle,
        command: &SafeCommand,
        constraints: &Constraints,
    ) -> std::result::Result<RunOutput, SandboxError>;

    /// Removes the image and any instance. Must tolerate either being absent.
    async fn destroy(&self, handle: &ImageHandle) -> std::result::Result<(), SandboxError>;

    /// Human-readable description, e.g. `"docker"`.
    fn description(&self) -> String;
}

/// What happened inside the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The test command ran to completion (any exit code)
    Finished(TestResult),
    /// Build failure, timeout or runtime fault; `result` records it
    Failed { result: TestResult, reason: String },
}

/// Inputs for one sandboxed verification.
#[derive(Debug)]
pub struct ExecuteRequest<'a> {
    pub job_id: &'a str,
    pub base_environment: &'a str,
    pub package_root: &'a Path,
    pub scratch: &'a Path,
    pub setup: Option<&'a SafeCommand>,
    pub test: &'a SafeCommand,
}

pub struct SandboxRunner {
    runtime: Arc<dyn SandboxRuntime>,
    config: SandboxConfig,
    /// Handles between their build attempt and their destroy, by image
    live: Mutex<HashMap<String, ImageHandle>>,
}

impl SandboxRunner {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: SandboxConfig) -> Self {
        Self {
            runtime,
            config,
            live: Mutex::new(HashMap::new()),
        }
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, ImageHandle>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Destroys every sandbox whose `execute` was cancelled before its own
    /// cleanup ran. Returns how many were destroyed.
    pub async fn destroy_all(&self) -> usize {
        let handles: Vec<ImageHandle> = self.live().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            info!("Destroying abandoned sandbox {}", handle.image);
            if let Err(e) = self.runtime.destroy(handle).await {
                warn!("Failed to destroy sandbox {}: {e}", handle.image);
            }
        }
        handles.len()
    }

    pub fn environments(&self) -> &BTreeMap<String, String> {
        &self.config.environments
    }

    /// Maps a manifest base environment to its pinned image.
    pub fn resolve_environment(&self, id: &str) -> Result<&str> {
        self.config
            .environments
            .get(id)
            .map(String::as_str)
            .ok_or_else(|| {
                VerifyError::Validation(format!(
                    "base environment '{id}' is not allowed (allowed: {})",
                    self.config
                        .environments
                        .keys()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }

    fn constraints(&self, timeout: Duration) -> Constraints {
        Constraints {
            network_disabled: true,
            memory_mb: self.config.memory_mb,
            cpus: self.config.cpus,
            pids_limit: self.config.pids_limit,
            tmpfs_mb: self.config.tmpfs_mb,
            timeout,
        }
    }

    /// Builds, runs and destroys. Only a disallowed base environment is
    /// returned as an error; everything the sandbox does is an outcome.
    pub async fn execute(&self, request: ExecuteRequest<'_>) -> Result<RunOutcome> {
        let base_image = self.resolve_environment(request.base_environment)?;
        let handle = ImageHandle::for_job(request.job_id);
        let started = Instant::now();
        self.live().insert(handle.image.clone(), handle.clone());

        info!(
            "Building sandbox image {} from {base_image} ({})",
            handle.image,
            self.runtime.description()
        );
        let build = BuildRequest {
            handle: &handle,
            base_image,
            context: request.package_root,
            scratch: request.scratch,
            setup: request.setup,
        };
        let build_result = self
            .runtime
            .build_image(&build, &self.constraints(self.config.build_timeout()))
            .await;

        let outcome = match build_result {
            Ok(()) => {
                info!("Running test command in {}: {}", handle.container, request.test);
                let run_result = self
                    .runtime
                    .run(&handle, request.test, &self.constraints(self.config.run_timeout()))
                    .await;
                self.run_outcome(run_result, started)
            }
            Err(e) => self.failure("sandbox build", e, started),
        };

        // Failed builds can leave partial images behind, so this runs
        // whatever happened above.
        if let Err(e) = self.runtime.destroy(&handle).await {
            warn!("Failed to destroy sandbox {}: {e}", handle.image);
        }
        self.live().remove(&handle.image);

        Ok(outcome)
    }

    fn run_outcome(
        &self,
        result: std::result::Result<RunOutput, SandboxError>,
        started: Instant,
    ) -> RunOutcome {
        match result {
            Ok(output) => RunOutcome::Finished(TestResult {
                passed: output.exit_code == 0,
                exit_code: output.exit_code,
                stdout: self.truncate(&output.stdout),
                stderr: self.truncate(&output.stderr),
                duration_ms: elapsed_ms(started),
                timed_out: false,
            }),
            Err(e) => self.failure("test run", e, started),
        }
    }

    fn failure(&self, phase: &str, error: SandboxError, started: Instant) -> RunOutcome {
        let reason = format!("{phase} {error}");
        warn!("Sandbox failure: {reason}");
        let (exit_code, stdout, stderr, timed_out) = match error {
            SandboxError::Timeout(_) => (TIMEOUT_EXIT_CODE, String::new(), reason.clone(), true),
            SandboxError::Failed {
                exit_code,
                stdout,
                stderr,
            } => (exit_code, stdout, stderr, false),
            SandboxError::Runtime(msg) => (RUNTIME_FAILURE_EXIT_CODE, String::new(), msg, false),
        };
        RunOutcome::Failed {
            result: TestResult {
                passed: false,
                exit_code,
                stdout: self.truncate(&stdout),
                stderr: self.truncate(&stderr),
                duration_ms: elapsed_ms(started),
                timed_out,
            },
            reason,
        }
    }

    fn truncate(&self, text: &str) -> String {
        let max = self.config.max_output_bytes;
        if text.len() <= max {
            return text.to_string();
        }
        format!(
            "{}\n[output truncated, {} bytes total]",
            truncate_utf8(text, max),
            text.len()
        )
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Truncate a UTF-8 string at or before `max_bytes`, respecting char boundaries.
fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::sanitize::parse_command;

    fn runner(runtime: Arc<FakeRuntime>) -> SandboxRunner {
        let config = SandboxConfig {
            max_output_bytes: 16,
            ..SandboxConfig::default()
        };
        SandboxRunner::new(runtime, config)
    }

    async fn execute(runner: &SandboxRunner, env: &str) -> Result<RunOutcome> {
        let test = parse_command("echo ok").unwrap();
        runner
            .execute(ExecuteRequest {
                job_id: "JOB1",
                base_environment: env,
                package_root: Path::new("/tmp/pkg"),
                scratch: Path::new("/tmp"),
                setup: None,
                test: &test,
            })
            .await
    }

    #[test]
    fn test_handle_names_are_lowercase() {
        let handle = ImageHandle::for_job("ABC-123");
        assert_eq!(handle.image, "skill-verifier/abc-123:ephemeral");
        assert_eq!(handle.container, "skill-verifier-abc-123");
    }

    #[test]
    fn test_resolve_environment_allowlist() {
        let runner = runner(Arc::new(FakeRuntime::exits(0, "")));
        assert_eq!(runner.resolve_environment("alpine").unwrap(), "alpine:3.20");
        let err = runner.resolve_environment("evil/image:latest").unwrap_err();
        assert!(matches!(err, VerifyError::Validation(_)));
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_passing_run() {
        let runtime = Arc::new(FakeRuntime::exits(0, "ok\n"));
        let outcome = execute(&runner(runtime.clone()), "alpine").await.unwrap();
        match outcome {
            RunOutcome::Finished(result) => {
                assert!(result.passed);
                assert_eq!(result.exit_code, 0);
                assert_eq!(result.stdout, "ok\n");
                assert!(!result.timed_out);
            }
            other => panic!("Expected Finished, got {other:?}"),
        }
        let calls = runtime.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("build skill-verifier/job1:ephemeral alpine:3.20"));
        assert_eq!(calls[1], "run echo ok");
        assert!(calls[2].starts_with("destroy"));
    }

    #[tokio::test]
    async fn test_failing_exit_code_is_finished_not_passed() {
        let runtime = Arc::new(FakeRuntime::exits(3, ""));
        match execute(&runner(runtime), "alpine").await.unwrap() {
            RunOutcome::Finished(result) => {
                assert!(!result.passed);
                assert_eq!(result.exit_code, 3);
            }
            other => panic!("Expected Finished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_failed_result_and_still_destroyed() {
        let runtime = Arc::new(FakeRuntime::new(Script::RunTimesOut));
        match execute(&runner(runtime.clone()), "alpine").await.unwrap() {
            RunOutcome::Failed { result, reason } => {
                assert!(result.timed_out);
                assert!(!result.passed);
                assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
                assert!(reason.contains("timed out"));
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
        assert!(runtime.calls().last().unwrap().starts_with("destroy"));
    }

    #[tokio::test]
    async fn test_build_failure_skips_run_but_destroys() {
        let runtime = Arc::new(FakeRuntime::new(Script::BuildFails));
        match execute(&runner(runtime.clone()), "alpine").await.unwrap() {
            RunOutcome::Failed { result, reason } => {
                assert!(reason.contains("sandbox build"));
                assert_eq!(result.stderr, "setup failed");
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
        let calls = runtime.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| !c.starts_with("run")));
    }

    #[tokio::test]
    async fn test_disallowed_environment_never_reaches_runtime() {
        let runtime = Arc::new(FakeRuntime::exits(0, ""));
        let err = execute(&runner(runtime.clone()), "ubuntu:latest").await.unwrap_err();
        assert!(matches!(err, VerifyError::Validation(_)));
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_output_is_truncated() {
        let runtime = Arc::new(FakeRuntime::exits(0, "0123456789abcdefghij"));
        match execute(&runner(runtime), "alpine").await.unwrap() {
            RunOutcome::Finished(result) => {
                assert!(result.stdout.starts_with("0123456789abcdef\n"));
                assert!(result.stdout.contains("20 bytes total"));
            }
            other => panic!("Expected Finished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_finished_runs_leave_nothing_to_destroy() {
        let runtime = Arc::new(FakeRuntime::exits(0, ""));
        let runner = runner(runtime.clone());
        execute(&runner, "alpine").await.unwrap();

        assert_eq!(runner.destroy_all().await, 0);
        assert_eq!(runtime.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_destroy_all_cleans_up_cancelled_run() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let runtime = Arc::new(FakeRuntime::gated(
            Script::Exit {
                code: 0,
                stdout: String::new(),
            },
            gate,
        ));
        let runner = runner(runtime.clone());

        // Dropped while the test command is still running
        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), execute(&runner, "alpine")).await;
        assert!(cancelled.is_err());
        assert!(runtime.calls().iter().all(|c| !c.starts_with("destroy")));

        assert_eq!(runner.destroy_all().await, 1);
        assert_eq!(
            runtime.calls().last().unwrap(),
            "destroy skill-verifier/job1:ephemeral"
        );
        assert_eq!(runner.destroy_all().await, 0);
    }

    #[test]
    fn test_truncate_utf8_respects_boundaries() {
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8("héllo", 3), "hé");
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }
}
