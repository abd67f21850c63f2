//! Queue-submission primitive.
//!
//! Specs hand validated jobs to a [`JobQueue`] and read back its records.
//! Scheduling, retries and backoff belong to whatever engine drains the
//! queue; none of that is modelled here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use jobwire_core::{JobId, ProjectId, SpecName};

/// Namespace a job id is unique within: one spec of one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobNamespace {
    pub project_id: ProjectId,
    pub spec: SpecName,
}

impl JobNamespace {
    pub fn new(project_id: ProjectId, spec: SpecName) -> Self {
        Self { project_id, spec }
    }
}

impl std::fmt::Display for JobNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.spec)
    }
}

/// Options forwarded untouched to the queue engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmissionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Engine-specific settings.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl SubmissionOptions {
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Job execution status as recorded by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Waiting,
    /// Picked up by a worker
    Active,
    Completed,
    Failed { error: String },
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed { .. } | JobStatus::Cancelled
        )
    }

    /// Terminal states are final; everything else moves forward only.
    pub fn can_transition_to(&self, next: &JobStatus) -> bool {
        match self {
            JobStatus::Waiting => !matches!(next, JobStatus::Waiting),
            JobStatus::Active => next.is_terminal(),
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed { .. } => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// A validated job handed to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub namespace: JobNamespace,
    pub job_id: JobId,
    pub params: JsonValue,
    pub options: SubmissionOptions,
    pub submitted_at: DateTime<Utc>,
}

/// A job as the queue knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub namespace: JobNamespace,
    pub job_id: JobId,
    pub params: JsonValue,
    pub options: SubmissionOptions,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn from_submission(submission: JobSubmission) -> Self {
        Self {
            namespace: submission.namespace,
            job_id: submission.job_id,
            params: submission.params,
            options: submission.options,
            status: JobStatus::Waiting,
            created_at: submission.submitted_at,
            updated_at: submission.submitted_at,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job already exists: {namespace}/{job_id}")]
    Duplicate {
        namespace: JobNamespace,
        job_id: JobId,
    },
    #[error("job not found: {namespace}/{job_id}")]
    NotFound {
        namespace: JobNamespace,
        job_id: JobId,
    },
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: &'static str,
        to: &'static str,
    },
    #[error("queue backend error: {0}")]
    Backend(String),
}

pub trait JobQueue: Send + Sync {
    /// Submit a job. Fails with [`QueueError::Duplicate`] if the id is taken.
    fn submit(&self, submission: JobSubmission) -> Result<JobId, QueueError>;

    fn get(&self, namespace: &JobNamespace, job_id: &JobId) -> Result<Option<JobRecord>, QueueError>;

    /// Move a job to a new status, returning the updated record.
    fn update_status(
        &self,
        namespace: &JobNamespace,
        job_id: &JobId,
        status: JobStatus,
    ) -> Result<JobRecord, QueueError>;
}

impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    fn submit(&self, submission: JobSubmission) -> Result<JobId, QueueError> {
        (**self).submit(submission)
    }

    fn get(&self, namespace: &JobNamespace, job_id: &JobId) -> Result<Option<JobRecord>, QueueError> {
        (**self).get(namespace, job_id)
    }

    fn update_status(
        &self,
        namespace: &JobNamespace,
        job_id: &JobId,
        status: JobStatus,
    ) -> Result<JobRecord, QueueError> {
        (**self).update_status(namespace, job_id, status)
    }
}

/// Shared transition check for queue implementations.
pub fn check_transition(record: &JobRecord, next: &JobStatus) -> Result<(), QueueError> {
    if record.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition {
            job_id: record.job_id.clone(),
            from: record.status.label(),
            to: next.label(),
        })
    }
}
