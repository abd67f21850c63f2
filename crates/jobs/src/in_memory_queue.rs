//! In-memory queue for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use jobwire_core::JobId;

use crate::queue::{
    JobNamespace, JobQueue, JobRecord, JobStatus, JobSubmission, QueueError, check_transition,
};

/// In-memory job queue.
///
/// Records submissions and status changes; nothing drains it.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: RwLock<HashMap<(JobNamespace, JobId), JobRecord>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every job of a namespace, oldest first.
    pub fn jobs(&self, namespace: &JobNamespace) -> Result<Vec<JobRecord>, QueueError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| QueueError::Backend("lock poisoned".to_string()))?;

        let mut out: Vec<JobRecord> = jobs
            .values()
            .filter(|r| &r.namespace == namespace)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }
}

impl JobQueue for InMemoryJobQueue {
    fn submit(&self, submission: JobSubmission) -> Result<JobId, QueueError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| QueueError::Backend("lock poisoned".to_string()))?;

        let key = (submission.namespace.clone(), submission.job_id.clone());
        if jobs.contains_key(&key) {
            return Err(QueueError::Duplicate {
                namespace: key.0,
                job_id: key.1,
            });
        }

        let id = submission.job_id.clone();
        jobs.insert(key, JobRecord::from_submission(submission));
        Ok(id)
    }

    fn get(&self, namespace: &JobNamespace, job_id: &JobId) -> Result<Option<JobRecord>, QueueError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| QueueError::Backend("lock poisoned".to_string()))?;
        Ok(jobs.get(&(namespace.clone(), job_id.clone())).cloned())
    }

    fn update_status(
        &self,
        namespace: &JobNamespace,
        job_id: &JobId,
        status: JobStatus,
    ) -> Result<JobRecord, QueueError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| QueueError::Backend("lock poisoned".to_string()))?;

        let record = jobs
            .get_mut(&(namespace.clone(), job_id.clone()))
            .ok_or_else(|| QueueError::NotFound {
                namespace: namespace.clone(),
                job_id: job_id.clone(),
            })?;

        check_transition(record, &status)?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SubmissionOptions;
    use jobwire_core::{ProjectId, SpecName};
    use serde_json::json;

    fn ns() -> JobNamespace {
        JobNamespace::new(ProjectId::parse("proj").unwrap(), SpecName::parse("transcode").unwrap())
    }

    fn submission(job_id: &str) -> JobSubmission {
        JobSubmission {
            namespace: ns(),
            job_id: JobId::parse(job_id).unwrap(),
            params: json!({"url": "http://x"}),
            options: SubmissionOptions::default(),
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn duplicate_ids_are_rejected_and_original_kept() {
        let queue = InMemoryJobQueue::new();
        queue.submit(submission("j1")).unwrap();

        let mut dup = submission("j1");
        dup.params = json!({"url": "http://other"});
        assert!(matches!(queue.submit(dup), Err(QueueError::Duplicate { .. })));

        let record = queue.get(&ns(), &JobId::parse("j1").unwrap()).unwrap().unwrap();
        assert_eq!(record.params, json!({"url": "http://x"}));
        assert_eq!(record.status, JobStatus::Waiting);
    }

    #[test]
    fn same_id_in_another_namespace_is_accepted() {
        let queue = InMemoryJobQueue::new();
        queue.submit(submission("j1")).unwrap();

        let mut other = submission("j1");
        other.namespace.spec = SpecName::parse("thumbnail").unwrap();
        assert!(queue.submit(other).is_ok());
    }

    #[test]
    fn status_updates_follow_transitions() {
        let queue = InMemoryJobQueue::new();
        let id = queue.submit(submission("j1")).unwrap();

        queue.update_status(&ns(), &id, JobStatus::Active).unwrap();
        let done = queue.update_status(&ns(), &id, JobStatus::Completed).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.updated_at >= done.created_at);

        let err = queue.update_status(&ns(), &id, JobStatus::Active).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { from: "completed", to: "active", .. }));
    }

    #[test]
    fn unknown_job_update_is_not_found() {
        let queue = InMemoryJobQueue::new();
        let err = queue
            .update_status(&ns(), &JobId::parse("nope").unwrap(), JobStatus::Active)
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound { .. }));
    }

    #[test]
    fn jobs_lists_one_namespace() {
        let queue = InMemoryJobQueue::new();
        queue.submit(submission("a")).unwrap();
        queue.submit(submission("b")).unwrap();
        assert_eq!(queue.jobs(&ns()).unwrap().len(), 2);
    }
}
