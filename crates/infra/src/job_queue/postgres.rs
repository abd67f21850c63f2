//! Postgres-backed job queue.
//!
//! Job records live in the `jobwire_jobs` table, keyed by
//! `(project_id, spec_name, job_id)`. The queue engine that executes jobs
//! reads the same table; this side only inserts records and moves their
//! status forward.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | QueueError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` (submit only) |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / other | N/A | `Backend` |
//!
//! ## Sync access
//!
//! [`JobQueue`] is a sync trait. Its methods drive the async queries on a
//! [`BlockingRuntime`]; called from inside a multi-threaded Tokio runtime they
//! use `block_in_place`, which a current-thread runtime does not support.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, instrument};

use jobwire_core::{JobId, ProjectId, SpecName};
use jobwire_jobs::{
    JobNamespace, JobQueue, JobRecord, JobStatus, JobSubmission, QueueError, SubmissionOptions,
    check_transition,
};

use super::query::{JobFilter, JobPage, JobQuery, Pagination};

const SCHEMA: &str = include_str!("../../migrations/0001_jobwire_jobs.sql");

/// Runtime used to drive async queries from sync callers.
#[derive(Debug, Clone)]
pub struct BlockingRuntime {
    handle: Handle,
    _owned: Option<Arc<Runtime>>,
}

impl BlockingRuntime {
    /// Drive queries on an existing runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            _owned: None,
        }
    }

    /// Own a dedicated multi-threaded runtime.
    pub fn dedicated() -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("jobwire-pg")
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            _owned: Some(Arc::new(runtime)),
        })
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        if Handle::try_current().is_ok() {
            tokio::task::block_in_place(|| self.handle.block_on(future))
        } else {
            self.handle.block_on(future)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    pool: Arc<PgPool>,
    runtime: BlockingRuntime,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool, runtime: BlockingRuntime) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Connect on a dedicated runtime and make sure the schema exists.
    pub fn connect_blocking(database_url: &str) -> Result<Self, QueueError> {
        let runtime = BlockingRuntime::dedicated()
            .map_err(|e| QueueError::Backend(format!("cannot start runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(5)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        let queue = Self::new(pool, runtime);
        queue.runtime.block_on(queue.ensure_schema())?;
        Ok(queue)
    }

    /// Create the jobs table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(
        skip(self, submission),
        fields(namespace = %submission.namespace, job_id = %submission.job_id),
        err
    )]
    pub async fn insert_job(&self, submission: JobSubmission) -> Result<JobId, QueueError> {
        let record = JobRecord::from_submission(submission);
        let (status, error) = status_columns(&record.status);

        let inserted: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO jobwire_jobs (
                project_id,
                spec_name,
                job_id,
                params,
                options,
                status,
                error,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (project_id, spec_name, job_id) DO NOTHING
            RETURNING job_id
            "#,
        )
        .bind(record.namespace.project_id.as_str())
        .bind(record.namespace.spec.as_str())
        .bind(record.job_id.as_str())
        .bind(&record.params)
        .bind(Json(&record.options))
        .bind(status)
        .bind(error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                QueueError::Duplicate {
                    namespace: record.namespace.clone(),
                    job_id: record.job_id.clone(),
                }
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        match inserted {
            Some(_) => Ok(record.job_id),
            None => Err(QueueError::Duplicate {
                namespace: record.namespace,
                job_id: record.job_id,
            }),
        }
    }

    pub async fn load_job(
        &self,
        namespace: &JobNamespace,
        job_id: &JobId,
    ) -> Result<Option<JobRecord>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT project_id, spec_name, job_id, params, options, status, error, created_at, updated_at
            FROM jobwire_jobs
            WHERE project_id = $1 AND spec_name = $2 AND job_id = $3
            "#,
        )
        .bind(namespace.project_id.as_str())
        .bind(namespace.spec.as_str())
        .bind(job_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_job", e))?;

        row.map(|row| JobRow::decode(&row)).transpose()
    }

    /// Move a job's status inside a row-locking transaction.
    #[instrument(
        skip(self),
        fields(namespace = %namespace, job_id = %job_id, status = status.label()),
        err
    )]
    pub async fn set_status(
        &self,
        namespace: &JobNamespace,
        job_id: &JobId,
        status: JobStatus,
    ) -> Result<JobRecord, QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            r#"
            SELECT project_id, spec_name, job_id, params, options, status, error, created_at, updated_at
            FROM jobwire_jobs
            WHERE project_id = $1 AND spec_name = $2 AND job_id = $3
            FOR UPDATE
            "#,
        )
        .bind(namespace.project_id.as_str())
        .bind(namespace.spec.as_str())
        .bind(job_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;

        let Some(row) = row else {
            return Err(QueueError::NotFound {
                namespace: namespace.clone(),
                job_id: job_id.clone(),
            });
        };
        let mut record = JobRow::decode(&row)?;
        check_transition(&record, &status)?;

        record.status = status;
        record.updated_at = Utc::now();
        let (status, error) = status_columns(&record.status);

        sqlx::query(
            r#"
            UPDATE jobwire_jobs
            SET status = $4, error = $5, updated_at = $6
            WHERE project_id = $1 AND spec_name = $2 AND job_id = $3
            "#,
        )
        .bind(namespace.project_id.as_str())
        .bind(namespace.spec.as_str())
        .bind(job_id.as_str())
        .bind(status)
        .bind(error)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(updated_at = %record.updated_at, "status committed");
        Ok(record)
    }
}

impl JobQueue for PostgresJobQueue {
    fn submit(&self, submission: JobSubmission) -> Result<JobId, QueueError> {
        self.runtime.block_on(self.insert_job(submission))
    }

    fn get(&self, namespace: &JobNamespace, job_id: &JobId) -> Result<Option<JobRecord>, QueueError> {
        self.runtime.block_on(self.load_job(namespace, job_id))
    }

    fn update_status(
        &self,
        namespace: &JobNamespace,
        job_id: &JobId,
        status: JobStatus,
    ) -> Result<JobRecord, QueueError> {
        self.runtime.block_on(self.set_status(namespace, job_id, status))
    }
}

#[async_trait::async_trait]
impl JobQuery for PostgresJobQueue {
    async fn list_jobs(
        &self,
        namespace: &JobNamespace,
        filter: JobFilter,
        pagination: Pagination,
    ) -> Result<JobPage, QueueError> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM jobwire_jobs
            WHERE project_id = $1 AND spec_name = $2 AND ($3::TEXT IS NULL OR status = $3)
            "#,
        )
        .bind(namespace.project_id.as_str())
        .bind(namespace.spec.as_str())
        .bind(filter.status.as_deref())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let rows = sqlx::query(
            r#"
            SELECT project_id, spec_name, job_id, params, options, status, error, created_at, updated_at
            FROM jobwire_jobs
            WHERE project_id = $1 AND spec_name = $2 AND ($3::TEXT IS NULL OR status = $3)
            ORDER BY created_at ASC, job_id ASC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(namespace.project_id.as_str())
        .bind(namespace.spec.as_str())
        .bind(filter.status.as_deref())
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let jobs = rows
            .iter()
            .map(JobRow::decode)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobPage::new(jobs, total.max(0) as u64, pagination))
    }
}

/// Column pair (`status`, `error`) for a status.
fn status_columns(status: &JobStatus) -> (&'static str, Option<&str>) {
    match status {
        JobStatus::Failed { error } => (status.label(), Some(error.as_str())),
        other => (other.label(), None),
    }
}

fn status_from_columns(status: &str, error: Option<String>) -> Result<JobStatus, QueueError> {
    Ok(match status {
        "waiting" => JobStatus::Waiting,
        "active" => JobStatus::Active,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed {
            error: error.unwrap_or_default(),
        },
        "cancelled" => JobStatus::Cancelled,
        other => {
            return Err(QueueError::Backend(format!("unknown job status in database: {other:?}")));
        }
    })
}

struct JobRow;

impl JobRow {
    fn decode(row: &PgRow) -> Result<JobRecord, QueueError> {
        let column = |e: sqlx::Error| QueueError::Backend(format!("failed to read job row: {e}"));

        let project_id: String = row.try_get("project_id").map_err(column)?;
        let spec_name: String = row.try_get("spec_name").map_err(column)?;
        let job_id: String = row.try_get("job_id").map_err(column)?;
        let params: serde_json::Value = row.try_get("params").map_err(column)?;
        let Json(options): Json<SubmissionOptions> = row.try_get("options").map_err(column)?;
        let status: String = row.try_get("status").map_err(column)?;
        let error: Option<String> = row.try_get("error").map_err(column)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(column)?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(column)?;

        let key = |e: jobwire_core::KeyError| QueueError::Backend(format!("invalid key in job row: {e}"));

        Ok(JobRecord {
            namespace: JobNamespace::new(
                ProjectId::parse(project_id).map_err(key)?,
                SpecName::parse(spec_name).map_err(key)?,
            ),
            job_id: JobId::parse(job_id).map_err(key)?,
            params,
            options,
            status: status_from_columns(&status, error)?,
            created_at,
            updated_at,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            QueueError::Backend(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            QueueError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => QueueError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_status_keeps_its_error_message() {
        let failed = JobStatus::Failed {
            error: "encoder crashed".into(),
        };
        let (label, error) = status_columns(&failed);
        assert_eq!((label, error), ("failed", Some("encoder crashed")));

        let back = status_from_columns(label, error.map(str::to_string)).unwrap();
        assert_eq!(back, failed);
    }

    #[test]
    fn borrowed_runtime_drives_queries_from_sync_and_async_callers() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let blocking = BlockingRuntime::from_handle(runtime.handle().clone());

        assert_eq!(blocking.block_on(async { 7 }), 7);

        let nested = blocking.clone();
        let from_worker = runtime
            .block_on(async move { tokio::spawn(async move { nested.block_on(async { 11 }) }).await })
            .unwrap();
        assert_eq!(from_worker, 11);
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(matches!(
            status_from_columns("paused", None),
            Err(QueueError::Backend(_))
        ));
    }

    /// Live tests need a database: `DATABASE_URL=postgres://... cargo test`.
    fn live_queue() -> Option<(PostgresJobQueue, JobNamespace)> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let queue = PostgresJobQueue::connect_blocking(&url).ok()?;
        let project = format!("test-{}", uuid::Uuid::now_v7().simple());
        let namespace = JobNamespace::new(
            ProjectId::parse(project).ok()?,
            SpecName::parse("transcode").ok()?,
        );
        Some((queue, namespace))
    }

    fn submission(namespace: &JobNamespace, job_id: &str) -> JobSubmission {
        JobSubmission {
            namespace: namespace.clone(),
            job_id: JobId::parse(job_id).unwrap(),
            params: json!({"input": "a.mov", "format": "webm"}),
            options: SubmissionOptions::default().with_priority(3),
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn live_submit_get_and_transition() {
        let Some((queue, ns)) = live_queue() else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };

        let id = queue.submit(submission(&ns, "j1")).unwrap();
        let err = queue.submit(submission(&ns, "j1")).unwrap_err();
        assert!(matches!(err, QueueError::Duplicate { .. }));

        let record = queue.get(&ns, &id).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Waiting);
        assert_eq!(record.options.priority, Some(3));
        assert_eq!(record.params["format"], json!("webm"));

        queue.update_status(&ns, &id, JobStatus::Active).unwrap();
        let failed = queue
            .update_status(&ns, &id, JobStatus::Failed { error: "boom".into() })
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed { error: "boom".into() });

        let err = queue.update_status(&ns, &id, JobStatus::Active).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
    }

    #[test]
    fn live_list_jobs_filters_and_pages() {
        let Some((queue, ns)) = live_queue() else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };

        for n in 0..3 {
            queue.submit(submission(&ns, &format!("j{n}"))).unwrap();
        }
        queue
            .update_status(&ns, &JobId::parse("j0").unwrap(), JobStatus::Cancelled)
            .unwrap();

        let waiting = queue
            .runtime
            .block_on(queue.list_jobs(
                &ns,
                JobFilter::status(JobStatus::Waiting),
                Pagination::new(Some(1), None),
            ))
            .unwrap();
        assert_eq!(waiting.total, 2);
        assert_eq!(waiting.jobs.len(), 1);
        assert!(waiting.has_more);
    }
}
