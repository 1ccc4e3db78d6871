//! In-memory job registry
//!
//! Single source of truth for job existence and state. Every status and
//! download request reads it; job creation, signer completion, download and
//! the cleanup timer write it, all from different tasks. The map is a
//! [`DashMap`], so each create/update/delete/lookup is atomic per key and
//! no caller holds a guard across an await point.

use crate::error::GatewayError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Lifecycle of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Signer not finished yet
    Pending,
    /// Signed artifact is ready at `artifact`
    Succeeded { artifact: PathBuf },
    /// Signer failed; `error` is never empty
    Failed { error: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One signing request's lifecycle record
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub state: JobState,
}

impl Job {
    fn new(id: i64) -> Self {
        Self {
            id,
            state: JobState::Pending,
        }
    }

    /// Wire representation
    pub fn status(&self) -> JobStatus {
        JobStatus::from(self)
    }
}

/// Job as reported by `GET /status/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: i64,
    pub processing: bool,
    pub success: bool,
    pub error: String,
}

impl From<&Job> for JobStatus {
    fn from(job: &Job) -> Self {
        let (processing, success, error) = match &job.state {
            JobState::Pending => (true, false, String::new()),
            JobState::Succeeded { .. } => (false, true, String::new()),
            JobState::Failed { error } => (false, false, error.clone()),
        };
        Self {
            id: job.id,
            processing,
            success,
            error,
        }
    }
}

/// Response body of `POST /sign`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub id: i64,
}

/// Outcome of [`JobRegistry::claim`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Job removed; the caller now owns the artifact and its scope
    Artifact(PathBuf),
    /// Signer still running, job left in place
    Pending,
    /// Signer failed, job left in place
    Failed(String),
}

/// Concurrent map from job id to [`Job`]
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<i64, Job>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending job. Never overwrites an existing entry.
    pub fn create(&self, id: i64) -> Result<Job, GatewayError> {
        match self.jobs.entry(id) {
            Entry::Occupied(_) => Err(GatewayError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                let job = Job::new(id);
                slot.insert(job.clone());
                debug!(job_id = id, "Registered job");
                Ok(job)
            }
        }
    }

    pub fn get(&self, id: i64) -> Result<Job, GatewayError> {
        self.jobs
            .get(&id)
            .map(|job| job.value().clone())
            .ok_or(GatewayError::NotFound(id))
    }

    /// Move a pending job to a terminal state
    pub fn mark_terminal(&self, id: i64, state: JobState) -> Result<(), GatewayError> {
        if let JobState::Failed { ref error } = state {
            if error.is_empty() {
                return Err(GatewayError::Internal(format!(
                    "job {} cannot fail without an error",
                    id
                )));
            }
        }
        if !state.is_terminal() {
            return Err(GatewayError::Internal(format!(
                "job {} can only move to a terminal state",
                id
            )));
        }

        let mut job = self.jobs.get_mut(&id).ok_or(GatewayError::NotFound(id))?;
        if job.state.is_terminal() {
            return Err(GatewayError::Internal(format!(
                "job {} is already terminal",
                id
            )));
        }
        job.state = state;
        Ok(())
    }

    pub fn mark_succeeded(&self, id: i64, artifact: PathBuf) -> Result<(), GatewayError> {
        self.mark_terminal(id, JobState::Succeeded { artifact })
    }

    pub fn mark_failed(&self, id: i64, error: impl Into<String>) -> Result<(), GatewayError> {
        self.mark_terminal(id, JobState::Failed { error: error.into() })
    }

    /// Delete an entry. Removing an absent id returns `None`.
    pub fn remove(&self, id: i64) -> Option<Job> {
        self.jobs.remove(&id).map(|(_, job)| job)
    }

    /// Consuming read used by download
    ///
    /// The job's state is inspected and, if it has succeeded, removed under a
    /// single entry lock, so a concurrent completion can never make a present
    /// job look absent and two callers can never both receive the artifact.
    pub fn claim(&self, id: i64) -> Result<Claim, GatewayError> {
        let Entry::Occupied(entry) = self.jobs.entry(id) else {
            return Err(GatewayError::NotFound(id));
        };

        match entry.get().state.clone() {
            JobState::Pending => Ok(Claim::Pending),
            JobState::Failed { error } => Ok(Claim::Failed(error)),
            JobState::Succeeded { artifact } => {
                entry.remove();
                Ok(Claim::Artifact(artifact))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
