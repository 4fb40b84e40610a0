/// Batch verification driver used by the command line.
///
/// At most `max_in_flight` packages are submitted at once. Each is
/// retried with exponential backoff while the verifier still reports it
/// is at capacity, polled until its job reaches a terminal state, and
/// deleted from the verifier once its [`Report`] is collected.
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::attestation::Attestation;
use crate::config::LimitsConfig;
use crate::error::{Result, VerifyError};
use crate::job::{Job, JobStatus};
use crate::orchestrator::Verifier;
use crate::package::Package;

/// Exponential delay between submission attempts rejected for capacity.
/// The delay doubles after each rejection, capped at `max_delay`.
pub struct RetryBackoff {
    max_delay: Duration,
    current_delay: Duration,
    /// Number of consecutive rejections so far.
    pub attempt: u32,
}

impl RetryBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_delay,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// Returns the current delay and doubles it for the next call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = (self.current_delay * 2).min(self.max_delay);
        delay
    }

    pub fn exhausted(&self, max_attempts: u32) -> bool {
        self.attempt >= max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub poll_interval: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Capacity rejections tolerated per package before giving up
    pub max_retries: u32,
    /// Packages submitted and awaited at the same time
    pub max_in_flight: usize,
}

impl BatchOptions {
    /// Keeps the batch within the verifier's concurrency cap.
    pub fn for_limits(limits: &LimitsConfig) -> Self {
        Self {
            max_in_flight: limits.max_concurrent_jobs,
            ..Self::default()
        }
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            retry_initial: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
            max_retries: 20,
            max_in_flight: LimitsConfig::default().max_concurrent_jobs,
        }
    }
}

/// Outcome of verifying one package, as printed by the CLI.
#[derive(Debug, Serialize)]
pub struct Report {
    pub package: String,
    pub job: Option<Job>,
    pub attestation: Option<Attestation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Report {
    /// True when the job completed and its test command exited 0.
    pub fn passed(&self) -> bool {
        self.job.as_ref().is_some_and(|job| {
            job.status == JobStatus::Completed && job.result.as_ref().is_some_and(|r| r.passed)
        })
    }

    fn rejected(package: String, error: VerifyError) -> Self {
        Self {
            package,
            job: None,
            attestation: None,
            error: Some(error.to_string()),
        }
    }
}

/// Verifies all packages concurrently; reports keep the input order.
pub async fn verify_all(
    verifier: &Verifier,
    packages: Vec<Package>,
    options: &BatchOptions,
) -> Vec<Report> {
    let permits = Semaphore::new(options.max_in_flight.max(1));
    let permits = &permits;
    join_all(packages.into_iter().map(|package| async move {
        // Never closed, so this only waits
        let _permit = permits.acquire().await.ok();
        verify_one(verifier, package, options).await
    }))
    .await
}

pub async fn verify_one(verifier: &Verifier, package: Package, options: &BatchOptions) -> Report {
    let name = package.name.clone();

    let job_id = match submit_with_retry(verifier, package, options).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Package '{name}' not submitted: {e}");
            return Report::rejected(name, e);
        }
    };
    info!("Package '{name}' submitted as job {job_id}");

    let job = match wait_for_terminal(verifier, &job_id, options.poll_interval).await {
        Ok(job) => job,
        Err(e) => return Report::rejected(name, e),
    };
    let attestation = verifier.attestation(&job_id).ok();

    // The report holds everything; free the tracked slot
    match verifier.delete(&job_id) {
        Ok(()) => debug!("Job {job_id} released"),
        Err(e) => warn!("Job {job_id} not deleted: {e}"),
    }

    Report {
        package: name,
        job: Some(job),
        attestation,
        error: None,
    }
}

async fn submit_with_retry(
    verifier: &Verifier,
    package: Package,
    options: &BatchOptions,
) -> Result<String> {
    let mut backoff = RetryBackoff::new(options.retry_initial, options.retry_max);
    loop {
        match verifier.submit(package.clone()).await {
            Err(e) if e.is_retriable() && !backoff.exhausted(options.max_retries) => {
                let delay = backoff.next_delay();
                info!(
                    "Verifier busy, retrying '{}' in {}ms (attempt {})",
                    package.name,
                    delay.as_millis(),
                    backoff.attempt
                );
                tokio::time::sleep(delay).await;
            }
            outcome => return outcome,
        }
    }
}

async fn wait_for_terminal(verifier: &Verifier, job_id: &str, interval: Duration) -> Result<Job> {
    loop {
        let job = verifier.status(job_id)?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        tokio::time::sleep(interval).await;
    }
}
