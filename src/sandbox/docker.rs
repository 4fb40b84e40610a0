/// Docker CLI sandbox runtime.
///
/// Every invocation goes through `tokio::process::Command` with an
/// explicit argv (no shell), a scrubbed environment and `kill_on_drop`.
/// Manifest commands reach Docker only as exec-form JSON arrays in the
/// generated Dockerfile or as trailing `docker run` arguments.
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{BuildRequest, Constraints, ImageHandle, RunOutput, SandboxError, SandboxRuntime};
use crate::sanitize::SafeCommand;

/// Timeout for cleanup commands (`rm`, `rmi`, `kill`).
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Unprivileged uid:gid the test command runs as.
const SANDBOX_USER: &str = "65534:65534";

/// Where package files land inside the image.
const SKILL_DIR: &str = "/skill";

const DOCKERFILE_NAME: &str = "Dockerfile.verifier";

pub struct DockerRuntime {
    binary: String,
}

impl DockerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Runs the CLI with a timeout. `Ok(None)` means the timeout fired
    /// (the client process is killed on drop).
    async fn exec(&self, args: &[String], timeout: Duration) -> Result<Option<Output>, SandboxError> {
        debug!("{} {}", self.binary, args.join(" "));
        let output = tokio::process::Command::new(&self.binary)
            .args(args)
            .env_clear()
            .envs(runtime_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, output).await {
            Ok(Ok(output)) => Ok(Some(output)),
            Ok(Err(e)) => Err(SandboxError::Runtime(format!(
                "cannot start {}: {e}",
                self.binary
            ))),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Best-effort cleanup command; returns the error text on failure.
    async fn cleanup(&self, args: &[String]) -> Result<(), String> {
        match self.exec(args, CLEANUP_TIMEOUT).await {
            Ok(Some(output)) if output.status.success() => Ok(()),
            Ok(Some(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if is_missing_object(&stderr) {
                    Ok(())
                } else {
                    Err(stderr.trim().to_string())
                }
            }
            Ok(None) => Err(format!("{} timed out", args.join(" "))),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn build_image(
        &self,
        request: &BuildRequest<'_>,
        constraints: &Constraints,
    ) -> Result<(), SandboxError> {
        let dockerfile = request.scratch.join(DOCKERFILE_NAME);
        let contents = dockerfile_contents(request.base_image, request.setup)
            .map_err(|e| SandboxError::Runtime(format!("cannot render Dockerfile: {e}")))?;
        tokio::fs::write(&dockerfile, contents)
            .await
            .map_err(|e| SandboxError::Runtime(format!("cannot write Dockerfile: {e}")))?;

        let args = build_args(&request.handle.image, &dockerfile, request.context, constraints);
        let result = self.exec(&args, constraints.timeout).await;

        if let Err(e) = tokio::fs::remove_file(&dockerfile).await {
            warn!("Failed to remove {}: {e}", dockerfile.display());
        }

        match result? {
            Some(output) if output.status.success() => Ok(()),
            Some(output) => Err(SandboxError::Failed {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            None => Err(SandboxError::Timeout(constraints.timeout)),
        }
    }

    async fn run(
        &self,
        handle: &ImageHandle,
        command: &SafeCommand,
        constraints: &Constraints,
    ) -> Result<RunOutput, SandboxError> {
        let args = run_args(handle, command, constraints);
        match self.exec(&args, constraints.timeout).await? {
            Some(output) => Ok(RunOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            None => {
                // Killing the CLI client does not stop the container
                let kill = vec!["kill".to_string(), handle.container.clone()];
                if let Err(e) = self.cleanup(&kill).await {
                    warn!("Failed to kill timed out container {}: {e}", handle.container);
                }
                Err(SandboxError::Timeout(constraints.timeout))
            }
        }
    }

    async fn destroy(&self, handle: &ImageHandle) -> Result<(), SandboxError> {
        let mut errors = Vec::new();
        let rm = vec!["rm".to_string(), "-f".to_string(), handle.container.clone()];
        if let Err(e) = self.cleanup(&rm).await {
            errors.push(format!("container {}: {e}", handle.container));
        }
        let rmi = vec!["rmi".to_string(), "-f".to_string(), handle.image.clone()];
        if let Err(e) = self.cleanup(&rmi).await {
            errors.push(format!("image {}: {e}", handle.image));
        }

        if errors.is_empty() {
            debug!("Destroyed {} / {}", handle.container, handle.image);
            Ok(())
        } else {
            Err(SandboxError::Runtime(errors.join("; ")))
        }
    }

    fn description(&self) -> String {
        self.binary.clone()
    }
}

/// Renders the build recipe. Commands are JSON exec-form arrays, so no
/// shell ever interprets manifest text.
fn dockerfile_contents(base_image: &str, setup: Option<&SafeCommand>) -> serde_json::Result<String> {
    let mut out = format!("FROM {base_image}\nCOPY . {SKILL_DIR}\nWORKDIR {SKILL_DIR}\n");
    if let Some(setup) = setup {
        out.push_str(&format!("RUN {}\n", serde_json::to_string(&setup.argv())?));
    }
    out.push_str(&format!("USER {SANDBOX_USER}\n"));
    Ok(out)
}

fn build_args(tag: &str, dockerfile: &Path, context: &Path, constraints: &Constraints) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "--quiet".to_string(),
        "--pull=false".to_string(),
        "--tag".to_string(),
        tag.to_string(),
        "--file".to_string(),
        dockerfile.display().to_string(),
    ];
    if constraints.network_disabled {
        args.push("--network".to_string());
        args.push("none".to_string());
    }
    args.push(context.display().to_string());
    args
}

fn run_args(handle: &ImageHandle, command: &SafeCommand, constraints: &Constraints) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--pull".to_string(),
        "never".to_string(),
        "--name".to_string(),
        handle.container.clone(),
    ];
    if constraints.network_disabled {
        args.push("--network".to_string());
        args.push("none".to_string());
    }
    args.extend([
        "--read-only".to_string(),
        "--tmpfs".to_string(),
        format!("/tmp:rw,noexec,nosuid,nodev,size={}m", constraints.tmpfs_mb),
        "--cap-drop".to_string(),
        "ALL".to_string(),
        "--security-opt".to_string(),
        "no-new-privileges".to_string(),
        "--user".to_string(),
        SANDBOX_USER.to_string(),
        "--pids-limit".to_string(),
        constraints.pids_limit.to_string(),
        "--memory".to_string(),
        format!("{}m", constraints.memory_mb),
        "--memory-swap".to_string(),
        format!("{}m", constraints.memory_mb),
        "--cpus".to_string(),
        constraints.cpus.to_string(),
        "--workdir".to_string(),
        SKILL_DIR.to_string(),
        // Image entrypoints (e.g. node's docker-entrypoint.sh) are bypassed
        "--entrypoint".to_string(),
        String::new(),
        handle.image.clone(),
    ]);
    args.extend(command.argv());
    args
}

/// `rm -f` / `rmi -f` on something already gone is not a failure.
fn is_missing_object(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no such image")
}

/// The set of environment variables forwarded to the container CLI.
/// Only what the client needs to find its daemon; no credentials.
fn runtime_env() -> Vec<(&'static str, String)> {
    let mut env = vec![(
        "PATH",
        "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".to_string(),
    )];
    for key in ["HOME", "DOCKER_HOST", "DOCKER_CONFIG", "DOCKER_CONTEXT"] {
        if let Ok(value) = std::env::var(key) {
            env.push((key, value));
        }
    }
    env
}
