//! Verification job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attestation::Attestation;
use crate::error::{ErrorKind, VerifyError};
use crate::manifest::ManifestSummary;
use crate::sandbox::TestResult;

pub type JobId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&VerifyError> for JobError {
    fn from(e: &VerifyError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub package_id: String,
    pub manifest: Option<ManifestSummary>,
    pub result: Option<TestResult>,
    pub attestation: Option<Attestation>,
    pub error: Option<JobError>,
}

impl Job {
    pub fn new(package_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            package_id,
            manifest: None,
            result: None,
            attestation: None,
            error: None,
        }
    }

    /// `pending → running`. Returns false if the job is not pending.
    pub fn start(&mut self) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// `running → completed`.
    pub fn complete(&mut self, result: TestResult, attestation: Attestation) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.attestation = Some(attestation);
        self.completed_at = Some(Utc::now());
    }

    /// `running → failed`. A sandbox failure keeps its result.
    pub fn fail(&mut self, error: &VerifyError, result: Option<TestResult>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.result = result;
        self.attestation = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        self.created_at
            .checked_add_signed(retention)
            .map_or(false, |deadline| deadline < now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new("skill".to_string());
        assert_eq!(job.status, JobStatus::Pending);
        assert!(Uuid::parse_str(&job.id).is_ok());
        assert!(job.started_at.is_none());
        assert!(job.result.is_none());
    }

    #[test]
    fn test_start_only_from_pending() {
        let mut job = Job::new("skill".to_string());
        assert!(job.start());
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());
        assert!(!job.start());
    }

    #[test]
    fn test_fail_records_error_kind() {
        let mut job = Job::new("skill".to_string());
        job.start();
        job.fail(&VerifyError::Validation("bad manifest".to_string()), None);
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.status.is_terminal());
        let error = job.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert!(error.message.contains("bad manifest"));
    }

    #[test]
    fn test_expiry() {
        let job = Job::new("skill".to_string());
        let retention = chrono::Duration::seconds(60);
        assert!(!job.is_expired(job.created_at + chrono::Duration::seconds(30), retention));
        assert!(job.is_expired(job.created_at + chrono::Duration::seconds(61), retention));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&JobStatus::Running).unwrap(), "\"running\"");
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert!(!JobStatus::Pending.is_terminal());
    }
}
