//! Redis-backed job queue.
//!
//! Keys (default prefix `jobwire`):
//! - `{prefix}:job:{project}/{spec}:{job_id}` JSON-encoded [`JobRecord`]
//! - `{prefix}:pending:{project}/{spec}` Redis Stream of submitted job ids,
//!   drained by whatever engine executes the jobs

use std::sync::Arc;

use chrono::Utc;
use redis::Commands;
use tracing::{debug, instrument};

use jobwire_core::JobId;
use jobwire_jobs::{
    JobNamespace, JobQueue, JobRecord, JobStatus, JobSubmission, QueueError, check_transition,
};

const DEFAULT_PREFIX: &str = "jobwire";

/// Record write and pending-stream append happen together or not at all.
const SUBMIT_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  redis.call('XADD', KEYS[2], '*', 'job_id', ARGV[2])
  return 1
end
return 0
"#;

#[derive(Debug, Clone)]
pub struct RedisJobQueue {
    client: Arc<redis::Client>,
    prefix: String,
    submit_script: redis::Script,
}

impl RedisJobQueue {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| backend("open client", e))?;
        Ok(Self {
            client: Arc::new(client),
            prefix: DEFAULT_PREFIX.to_string(),
            submit_script: redis::Script::new(SUBMIT_SCRIPT),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn job_key(&self, namespace: &JobNamespace, job_id: &JobId) -> String {
        format!("{}:job:{}:{}", self.prefix, namespace, job_id)
    }

    /// Stream of job ids waiting to be picked up.
    pub fn pending_key(&self, namespace: &JobNamespace) -> String {
        format!("{}:pending:{}", self.prefix, namespace)
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client.get_connection().map_err(|e| backend("connect", e))
    }
}

impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, submission), fields(namespace = %submission.namespace, job_id = %submission.job_id), err)]
    fn submit(&self, submission: JobSubmission) -> Result<JobId, QueueError> {
        let record = JobRecord::from_submission(submission);
        let encoded = encode(&record)?;
        let job_key = self.job_key(&record.namespace, &record.job_id);
        let pending_key = self.pending_key(&record.namespace);

        let mut conn = self.connection()?;
        let inserted: i64 = self
            .submit_script
            .key(&job_key)
            .key(&pending_key)
            .arg(encoded)
            .arg(record.job_id.as_str())
            .invoke(&mut conn)
            .map_err(|e| backend("submit", e))?;

        if inserted == 0 {
            return Err(QueueError::Duplicate {
                namespace: record.namespace,
                job_id: record.job_id,
            });
        }

        debug!("job queued");
        Ok(record.job_id)
    }

    fn get(&self, namespace: &JobNamespace, job_id: &JobId) -> Result<Option<JobRecord>, QueueError> {
        let mut conn = self.connection()?;
        let raw: Option<String> = conn
            .get(self.job_key(namespace, job_id))
            .map_err(|e| backend("GET job", e))?;
        raw.as_deref().map(decode).transpose()
    }

    #[instrument(skip(self), fields(namespace = %namespace, job_id = %job_id, status = status.label()), err)]
    fn update_status(
        &self,
        namespace: &JobNamespace,
        job_id: &JobId,
        status: JobStatus,
    ) -> Result<JobRecord, QueueError> {
        let key = self.job_key(namespace, job_id);
        let mut conn = self.connection()?;

        // WATCH/MULTI retry loop; a concurrent writer forces a re-read.
        let outcome: Result<JobRecord, QueueError> =
            redis::transaction(&mut conn, &[&key], |conn, pipe| {
                let raw: Option<String> = conn.get(&key)?;
                let Some(raw) = raw else {
                    return Ok(Some(Err(QueueError::NotFound {
                        namespace: namespace.clone(),
                        job_id: job_id.clone(),
                    })));
                };

                let mut record = match decode(&raw) {
                    Ok(record) => record,
                    Err(err) => return Ok(Some(Err(err))),
                };
                if let Err(err) = check_transition(&record, &status) {
                    return Ok(Some(Err(err)));
                }
                record.status = status.clone();
                record.updated_at = Utc::now();

                let encoded = match encode(&record) {
                    Ok(encoded) => encoded,
                    Err(err) => return Ok(Some(Err(err))),
                };
                pipe.set(&key, encoded)
                    .ignore()
                    .query::<Option<()>>(conn)
                    .map(|committed| committed.map(|_| Ok(record)))
            })
            .map_err(|e| backend("update_status", e))?;

        outcome
    }
}

fn encode(record: &JobRecord) -> Result<String, QueueError> {
    serde_json::to_string(record).map_err(|e| QueueError::Backend(format!("cannot encode job record: {e}")))
}

fn decode(raw: &str) -> Result<JobRecord, QueueError> {
    serde_json::from_str(raw).map_err(|e| QueueError::Backend(format!("corrupt job record: {e}")))
}

fn backend(operation: &str, err: redis::RedisError) -> QueueError {
    QueueError::Backend(format!("redis {operation} failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobwire_core::{ProjectId, SpecName};
    use jobwire_jobs::SubmissionOptions;
    use serde_json::json;

    fn namespace() -> JobNamespace {
        JobNamespace::new(
            ProjectId::parse("media").unwrap(),
            SpecName::parse("transcode").unwrap(),
        )
    }

    fn submission(job_id: &str) -> JobSubmission {
        JobSubmission {
            namespace: namespace(),
            job_id: JobId::parse(job_id).unwrap(),
            params: json!({"input": "a.mov"}),
            options: SubmissionOptions::default(),
            submitted_at: Utc::now(),
        }
    }

    /// Live tests need a server: `REDIS_URL=redis://localhost:6379 cargo test --features redis`.
    fn live_queue() -> Option<RedisJobQueue> {
        let url = std::env::var("REDIS_URL").ok()?;
        let prefix = format!("jobwire-test-{}", uuid::Uuid::now_v7());
        Some(RedisJobQueue::new(url).ok()?.with_prefix(prefix))
    }

    #[test]
    fn keys_are_scoped_by_namespace() {
        let queue = RedisJobQueue::new("redis://127.0.0.1:6379").unwrap();
        assert_eq!(
            queue.job_key(&namespace(), &JobId::parse("j1").unwrap()),
            "jobwire:job:media/transcode:j1"
        );
        assert_eq!(queue.pending_key(&namespace()), "jobwire:pending:media/transcode");
    }

    #[test]
    fn live_submit_rejects_duplicates() {
        let Some(queue) = live_queue() else {
            eprintln!("REDIS_URL not set; skipping");
            return;
        };

        queue.submit(submission("j1")).unwrap();
        let err = queue.submit(submission("j1")).unwrap_err();
        assert!(matches!(err, QueueError::Duplicate { .. }));

        let mut conn = queue.client.get_connection().unwrap();
        let pending: usize = conn.xlen(queue.pending_key(&namespace())).unwrap();
        assert_eq!(pending, 1);
    }

    #[test]
    fn live_status_transitions() {
        let Some(queue) = live_queue() else {
            eprintln!("REDIS_URL not set; skipping");
            return;
        };
        let id = queue.submit(submission("j2")).unwrap();

        let active = queue.update_status(&namespace(), &id, JobStatus::Active).unwrap();
        assert_eq!(active.status, JobStatus::Active);
        queue.update_status(&namespace(), &id, JobStatus::Completed).unwrap();

        let err = queue
            .update_status(&namespace(), &id, JobStatus::Active)
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        assert_eq!(
            queue.get(&namespace(), &id).unwrap().unwrap().status,
            JobStatus::Completed
        );
    }
}
