//! Job listing for inspection tooling.
//!
//! Read-only and paginated by default. Scoped to one namespace per call.

use jobwire_jobs::{InMemoryJobQueue, JobNamespace, JobRecord, JobStatus, QueueError};
use serde::{Deserialize, Serialize};

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 1000;

/// Pagination parameters for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    /// 0-based
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    /// Status label, e.g. "waiting" or "failed".
    pub status: Option<String>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status.label().to_string()),
        }
    }

    fn matches(&self, record: &JobRecord) -> bool {
        self.status
            .as_deref()
            .is_none_or(|label| record.status.label() == label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<JobRecord>,
    /// Jobs matching the filter across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl JobPage {
    pub fn new(jobs: Vec<JobRecord>, total: u64, pagination: Pagination) -> Self {
        let has_more = u64::from(pagination.offset) + (jobs.len() as u64) < total;
        Self {
            jobs,
            total,
            pagination,
            has_more,
        }
    }
}

#[async_trait::async_trait]
pub trait JobQuery: Send + Sync {
    /// Jobs of a namespace, oldest first.
    async fn list_jobs(
        &self,
        namespace: &JobNamespace,
        filter: JobFilter,
        pagination: Pagination,
    ) -> Result<JobPage, QueueError>;
}

#[async_trait::async_trait]
impl JobQuery for InMemoryJobQueue {
    async fn list_jobs(
        &self,
        namespace: &JobNamespace,
        filter: JobFilter,
        pagination: Pagination,
    ) -> Result<JobPage, QueueError> {
        let matching: Vec<JobRecord> = self
            .jobs(namespace)?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        let total = matching.len() as u64;

        let jobs = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();

        Ok(JobPage::new(jobs, total, pagination))
    }
}
