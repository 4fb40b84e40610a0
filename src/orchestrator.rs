//! Job orchestration: admission control, the per-job verification
//! pipeline and retention.
//!
//! ```text
//! submit ─► pending ─► running ─► Extract ─► Parse ─► Sanitize ─► Run ─► Attest
//!                                    │          │         │         │
//!                                    └──────────┴─────────┴─────────┴─► failed
//!                                                                 completed ◄─┘
//! ```
//!
//! The job table is the only shared state. It sits behind a single
//! `std::sync::Mutex` that is never held across an `.await`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::attestation::{Attestation, AttestationGenerator, Subject, TeeOracle};
use crate::config::{Config, LimitsConfig, StorageConfig};
use crate::error::{Result, VerifyError};
use crate::job::{Job, JobId, JobStatus};
use crate::manifest::{load_manifest, Manifest, ManifestSummary};
use crate::package::{self, extract, ArchiveLimits, ExtractSource, Package, PackageSource};
use crate::sandbox::{ExecuteRequest, RunOutcome, SandboxRunner, SandboxRuntime, TestResult};
use crate::sanitize::parse_command;

/// Handle to the verification service. Cheap to clone.
#[derive(Clone)]
pub struct Verifier {
    inner: Arc<Inner>,
}

struct Inner {
    jobs: Mutex<HashMap<JobId, Job>>,
    /// Pipeline tasks still running, aborted on shutdown
    tasks: Mutex<HashMap<JobId, JoinHandle<()>>>,
    limits: LimitsConfig,
    storage: StorageConfig,
    runner: SandboxRunner,
    attestor: AttestationGenerator,
}

/// Where a job reads its package from once admitted.
#[derive(Debug)]
enum Staged {
    /// Bytes written by `submit`; owned by the job
    Upload(PathBuf),
    /// Caller-owned archive file
    ArchiveFile(PathBuf),
    /// Caller-owned directory
    Directory(PathBuf),
}

/// The stage failure that ends a job.
struct StageFailure {
    error: VerifyError,
    /// Set when the sandbox produced a (failed) result
    result: Option<TestResult>,
}

impl From<VerifyError> for StageFailure {
    fn from(error: VerifyError) -> Self {
        Self {
            error,
            result: None,
        }
    }
}

/// Removes a job's scratch paths when dropped, on every exit path.
struct ScratchGuard {
    job_id: JobId,
    work_dir: PathBuf,
    build_dir: PathBuf,
    upload: Option<PathBuf>,
}

impl ScratchGuard {
    /// Deletes the upload as soon as it has been extracted.
    fn release_upload(&mut self) {
        if let Some(path) = self.upload.take() {
            remove_artifact(&path);
        }
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        self.release_upload();
        remove_artifact(&self.work_dir);
        remove_artifact(&self.build_dir);
        debug!("Scratch space of job {} removed", self.job_id);
    }
}

impl Verifier {
    /// Creates the storage directories and wires the pipeline stages.
    pub fn new(
        config: &Config,
        runtime: Arc<dyn SandboxRuntime>,
        oracle: Option<Arc<dyn TeeOracle>>,
    ) -> Result<Self> {
        let storage = config.storage.clone();
        for dir in [&storage.upload_root, &storage.work_root, &storage.results_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                VerifyError::Infrastructure(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        info!(
            "Verifier ready: runtime={}, max_concurrent_jobs={}, max_tracked_jobs={}",
            runtime.description(),
            config.limits.max_concurrent_jobs,
            config.limits.max_tracked_jobs
        );

        Ok(Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                limits: config.limits.clone(),
                storage,
                runner: SandboxRunner::new(runtime, config.sandbox.clone()),
                attestor: AttestationGenerator::new(oracle),
            }),
        })
    }

    /// Admits a package and starts verifying it in the background.
    ///
    /// Returns `ResourceExhausted` (no job created) when a cap is reached.
    pub async fn submit(&self, package: Package) -> Result<JobId> {
        let job_id = self.inner.admit(&package)?;

        let staged = match package.source {
            PackageSource::Archive(bytes) => {
                let path = self.inner.upload_path(&job_id);
                if let Err(e) = tokio::fs::write(&path, &bytes).await {
                    error!("Failed to store upload for job {job_id}: {e}");
                    self.inner.jobs().remove(&job_id);
                    remove_artifact(&path);
                    return Err(VerifyError::Infrastructure(format!(
                        "failed to store uploaded package: {e}"
                    )));
                }
                Staged::Upload(path)
            }
            PackageSource::ArchiveFile(path) => Staged::ArchiveFile(path),
            PackageSource::Directory(path) => Staged::Directory(path),
        };

        let inner = self.inner.clone();
        let id = job_id.clone();
        // Registered before the task can deregister itself
        let mut tasks = self.inner.tasks();
        let task = tokio::spawn(async move { inner.process(id, package.name, staged).await });
        tasks.insert(job_id.clone(), task);
        drop(tasks);

        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Result<Job> {
        self.inner
            .jobs()
            .get(job_id)
            .cloned()
            .ok_or_else(|| VerifyError::NotFound(job_id.to_string()))
    }

    /// The attestation of a `completed` job.
    pub fn attestation(&self, job_id: &str) -> Result<Attestation> {
        let job = self.status(job_id)?;
        match (job.status, job.attestation) {
            (JobStatus::Completed, Some(attestation)) => Ok(attestation),
            (status, _) => Err(VerifyError::NotCompleted(format!("{job_id} is {status}"))),
        }
    }

    /// Removes a terminal job and its result file.
    pub fn delete(&self, job_id: &str) -> Result<()> {
        {
            let mut jobs = self.inner.jobs();
            let job = jobs
                .get(job_id)
                .ok_or_else(|| VerifyError::NotFound(job_id.to_string()))?;
            if !job.status.is_terminal() {
                return Err(VerifyError::JobActive(job_id.to_string()));
            }
            jobs.remove(job_id);
        }
        remove_artifact(&self.inner.result_path(job_id));
        info!("Job {job_id} deleted");
        Ok(())
    }

    /// Evicts every job created more than the retention window before
    /// `now`, whatever its state, with all of its on-disk artifacts.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let retention = chrono::Duration::from_std(self.inner.limits.retention())
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));

        let evicted: Vec<Job> = {
            let mut jobs = self.inner.jobs();
            let expired: Vec<JobId> = jobs
                .values()
                .filter(|job| job.is_expired(now, retention))
                .map(|job| job.id.clone())
                .collect();
            expired.iter().filter_map(|id| jobs.remove(id)).collect()
        };

        for job in &evicted {
            if job.status.is_terminal() {
                debug!("Job {} expired", job.id);
            } else {
                warn!("Evicting job {} while still {}", job.id, job.status);
            }
            self.inner.remove_artifacts(&job.id);
        }
        if !evicted.is_empty() {
            info!("Swept {} expired job(s)", evicted.len());
        }
        evicted.into_iter().map(|job| job.id).collect()
    }

    /// Stops every in-flight job and removes what it left behind.
    ///
    /// Pipeline tasks are aborted (their scratch guards run), sandboxes
    /// they never got to destroy are destroyed, and the jobs are marked
    /// `failed`. Terminal jobs and their result files are kept.
    pub async fn shutdown(&self) {
        let tasks: Vec<(JobId, JoinHandle<()>)> = self.inner.tasks().drain().collect();
        for (_, task) in &tasks {
            task.abort();
        }
        for (job_id, task) in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Job {job_id} task failed during shutdown: {e}");
                }
            }
        }

        let destroyed = self.inner.runner.destroy_all().await;

        let interrupted: Vec<JobId> = {
            let mut jobs = self.inner.jobs();
            let error = VerifyError::Infrastructure("verifier shut down".to_string());
            jobs.values_mut()
                .filter(|job| !job.status.is_terminal())
                .map(|job| {
                    job.fail(&error, None);
                    job.id.clone()
                })
                .collect()
        };
        for job_id in &interrupted {
            self.inner.remove_scratch(job_id);
        }
        info!(
            "Verifier shut down: {} job(s) interrupted, {destroyed} sandbox(es) destroyed",
            interrupted.len()
        );
    }

    /// Runs [`Verifier::sweep_expired`] every `sweep_interval`.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let verifier = self.clone();
        let period = self.inner.limits.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                verifier.sweep_expired(Utc::now());
            }
        })
    }
}

impl Inner {
    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check-and-insert in one critical section.
    fn admit(&self, package: &Package) -> Result<JobId> {
        let mut jobs = self.jobs();
        let active = jobs.values().filter(|j| !j.status.is_terminal()).count();
        if active >= self.limits.max_concurrent_jobs {
            warn!("Rejecting submission: {active} jobs in flight");
            return Err(VerifyError::ResourceExhausted(format!(
                "{active} jobs in flight (max {})",
                self.limits.max_concurrent_jobs
            )));
        }
        if jobs.len() >= self.limits.max_tracked_jobs {
            warn!("Rejecting submission: {} jobs tracked", jobs.len());
            return Err(VerifyError::ResourceExhausted(format!(
                "{} jobs tracked (max {})",
                jobs.len(),
                self.limits.max_tracked_jobs
            )));
        }

        // An invalid name hint fails the job in its extract stage
        let job = Job::new(package.id().unwrap_or_default());
        let job_id = job.id.clone();
        info!("Job {job_id} accepted for package '{}'", package.name);
        jobs.insert(job_id.clone(), job);
        Ok(job_id)
    }

    fn upload_path(&self, job_id: &str) -> PathBuf {
        self.storage.upload_root.join(format!("{job_id}.pkg"))
    }

    fn work_dir(&self, job_id: &str) -> PathBuf {
        self.storage.work_root.join(job_id)
    }

    /// Runtime bookkeeping (Dockerfile), kept outside the build context.
    fn build_dir(&self, job_id: &str) -> PathBuf {
        self.storage.work_root.join(format!("{job_id}.build"))
    }

    fn result_path(&self, job_id: &str) -> PathBuf {
        self.storage.results_dir.join(format!("{job_id}.json"))
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<JobId, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_artifacts(&self, job_id: &str) {
        remove_artifact(&self.result_path(job_id));
        self.remove_scratch(job_id);
    }

    fn remove_scratch(&self, job_id: &str) {
        remove_artifact(&self.work_dir(job_id));
        remove_artifact(&self.build_dir(job_id));
        remove_artifact(&self.upload_path(job_id));
    }

    async fn process(self: Arc<Self>, job_id: JobId, name: String, staged: Staged) {
        let started = self.jobs().get_mut(&job_id).map(Job::start);
        if started != Some(true) {
            debug!("Job {job_id} no longer pending, not starting");
            self.tasks().remove(&job_id);
            return;
        }
        info!("Job {job_id} running");

        let mut scratch = ScratchGuard {
            job_id: job_id.clone(),
            work_dir: self.work_dir(&job_id),
            build_dir: self.build_dir(&job_id),
            upload: match &staged {
                Staged::Upload(path) => Some(path.clone()),
                _ => None,
            },
        };

        let mut manifest = None;
        let verdict = self
            .verify(&job_id, &name, &staged, &mut scratch, &mut manifest)
            .await;
        drop(scratch);

        self.finish(&job_id, manifest.map(|m| m.summary()), verdict)
            .await;
        self.tasks().remove(&job_id);
    }

    /// Extract → Parse → Sanitize → Run → Attest. The first failing
    /// stage ends the pipeline.
    async fn verify(
        &self,
        job_id: &str,
        name: &str,
        staged: &Staged,
        scratch: &mut ScratchGuard,
        manifest_out: &mut Option<Manifest>,
    ) -> std::result::Result<(TestResult, Attestation), StageFailure> {
        // Extract + Parse
        let package_id = package::package_id(name)?;
        let dest = scratch.work_dir.join(&package_id);
        let limits = ArchiveLimits::from(&self.limits);
        let (source, is_archive) = match staged {
            Staged::Upload(path) | Staged::ArchiveFile(path) => (path.clone(), true),
            Staged::Directory(path) => (path.clone(), false),
        };
        let protected = vec![
            self.storage.upload_root.clone(),
            self.storage.work_root.clone(),
            self.storage.results_dir.clone(),
        ];
        let unpacked = blocking(move || {
            let source = if is_archive {
                ExtractSource::Archive(&source)
            } else {
                ExtractSource::Directory {
                    path: &source,
                    protected: &protected,
                }
            };
            let root = extract(source, &dest, &limits)?;
            let manifest = load_manifest(&root)?;
            Ok((root, manifest))
        })
        .await;
        scratch.release_upload();
        let (package_root, manifest) = unpacked?;
        info!(
            "Job {job_id}: package {} {} extracted",
            manifest.name, manifest.version
        );
        let manifest = manifest_out.insert(manifest);

        // Sanitize
        let test = parse_command(&manifest.test_command)?;
        let setup = manifest
            .setup_command
            .as_deref()
            .map(parse_command)
            .transpose()?;

        // Run
        tokio::fs::create_dir_all(&scratch.build_dir)
            .await
            .map_err(VerifyError::from)?;
        let outcome = self
            .runner
            .execute(ExecuteRequest {
                job_id,
                base_environment: &manifest.base_environment,
                package_root: &package_root,
                scratch: &scratch.build_dir,
                setup: setup.as_ref(),
                test: &test,
            })
            .await?;
        let result = match outcome {
            RunOutcome::Finished(result) => result,
            RunOutcome::Failed { result, reason } => {
                return Err(StageFailure {
                    error: VerifyError::Sandbox(reason),
                    result: Some(result),
                });
            }
        };

        // Attest
        let subject = Subject {
            job_id,
            package: &manifest.name,
            version: &manifest.version,
        };
        let attestation = self.attestor.attest(&subject, &result).await;
        Ok((result, attestation))
    }

    /// Persists and publishes the terminal state.
    async fn finish(
        &self,
        job_id: &str,
        manifest: Option<ManifestSummary>,
        verdict: std::result::Result<(TestResult, Attestation), StageFailure>,
    ) {
        let Some(mut job) = self.jobs().get(job_id).cloned() else {
            warn!("Job {job_id} was evicted while running, discarding its outcome");
            return;
        };

        job.manifest = manifest;
        match verdict {
            Ok((result, attestation)) => {
                info!(
                    "Job {job_id} completed: passed={} exit_code={} ({} ms)",
                    result.passed, result.exit_code, result.duration_ms
                );
                job.complete(result, attestation);
            }
            Err(StageFailure { error, result }) => {
                info!("Job {job_id} failed: {error}");
                job.fail(&error, result);
            }
        }

        // The record on disk is written before the state becomes visible,
        // so a failed write can still turn the outcome into `failed`.
        if let Err(e) = self.persist(&job).await {
            error!("Failed to persist result of job {job_id}: {e}");
            let result = job.result.take();
            job.fail(&e, result);
        }

        let published = match self.jobs().get_mut(job_id) {
            Some(slot) => {
                *slot = job;
                true
            }
            None => false,
        };
        if !published {
            warn!("Job {job_id} was evicted while finishing, discarding its outcome");
            remove_artifact(&self.result_path(job_id));
        }
    }

    async fn persist(&self, job: &Job) -> Result<()> {
        let json = serde_json::to_string_pretty(job)
            .map_err(|e| VerifyError::Infrastructure(format!("cannot serialize job: {e}")))?;
        let path = self.result_path(&job.id);
        let tmp = path.with_extension("json.tmp");
        blocking(move || {
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, &path).map_err(|e| {
                remove_artifact(&tmp);
                e.into()
            })
        })
        .await
    }
}

/// Runs filesystem work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VerifyError::Infrastructure(format!("blocking task failed: {e}")))?
}

/// Removes a file or directory tree. Absence is fine; other failures are
/// logged only.
fn remove_artifact(path: &Path) {
    let outcome = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => Err(e),
    };
    if let Err(e) = outcome {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {e}", path.display());
        }
    }
}
