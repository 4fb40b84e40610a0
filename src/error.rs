//! Error taxonomy for the verification pipeline.
//!
//! Validation and sandbox errors are routine outcomes of verifying
//! untrusted input: they end up in the job record. Resource exhaustion
//! and infrastructure faults are the only ones returned to the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    /// Malformed manifest, archive policy violation, disallowed command
    /// or base environment.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Concurrency or queue cap reached. No job was created; retry later.
    #[error("resource exhausted: {0} (retry later)")]
    ResourceExhausted(String),

    /// Sandbox build or run failure, including timeouts.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// Disk or collaborator failure outside the sandbox.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job active: {0} has not reached a terminal state")]
    JobActive(String),

    #[error("job not completed: {0}")]
    NotCompleted(String),
}

/// Serialized error class stored in job records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ResourceExhausted,
    Sandbox,
    Infrastructure,
    NotFound,
    JobActive,
    NotCompleted,
}

impl VerifyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Sandbox(_) => ErrorKind::Sandbox,
            Self::Infrastructure(_) => ErrorKind::Infrastructure,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::JobActive(_) => ErrorKind::JobActive,
            Self::NotCompleted(_) => ErrorKind::NotCompleted,
        }
    }

    /// True when the caller should retry the same request later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

impl From<std::io::Error> for VerifyError {
    fn from(e: std::io::Error) -> Self {
        Self::Infrastructure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VerifyError>;
