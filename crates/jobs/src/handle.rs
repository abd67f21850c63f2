//! Worker-side view of a single job.

use jobwire_core::{JobId, Schema};
use jobwire_streams::Stream;
use tracing::{info, warn};

use crate::queue::{JobRecord, JobStatus};
use crate::spec::{JobSpec, JobSpecError};

/// A job instance of a spec: its streams and its queue record.
pub struct JobHandle<P, I, O, Pr> {
    spec: JobSpec<P, I, O, Pr>,
    job_id: JobId,
}

impl<P, I, O, Pr> Clone for JobHandle<P, I, O, Pr> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            job_id: self.job_id.clone(),
        }
    }
}

impl<P, I, O, Pr> std::fmt::Debug for JobHandle<P, I, O, Pr> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("spec", &self.spec)
            .field("job_id", &self.job_id)
            .finish()
    }
}

impl<P, I, O, Pr> JobHandle<P, I, O, Pr>
where
    P: Schema,
    I: Schema,
    O: Schema,
    Pr: Schema,
{
    pub(crate) fn new(spec: JobSpec<P, I, O, Pr>, job_id: JobId) -> Self {
        Self { spec, job_id }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn spec(&self) -> &JobSpec<P, I, O, Pr> {
        &self.spec
    }

    pub fn input(&self) -> Result<Stream<I>, JobSpecError> {
        self.spec.input_stream(&self.job_id)
    }

    pub fn output(&self) -> Result<Stream<O>, JobSpecError> {
        self.spec.output_stream(&self.job_id, None)
    }

    pub fn progress(&self) -> Result<Stream<Pr>, JobSpecError> {
        self.spec.progress_stream(&self.job_id)
    }

    pub fn record(&self) -> Result<Option<JobRecord>, JobSpecError> {
        self.spec.get_job(&self.job_id)
    }

    pub fn status(&self) -> Result<Option<JobStatus>, JobSpecError> {
        self.spec.get_job_status(&self.job_id)
    }

    /// Submitted parameters, decoded and re-validated.
    pub fn params(&self) -> Result<Option<P>, JobSpecError> {
        self.record()?
            .map(|r| self.spec.validate_params(r.params).map_err(JobSpecError::from))
            .transpose()
    }

    pub fn emit_output(&self, value: &O) -> Result<u64, JobSpecError> {
        Ok(self.output()?.publish(value)?)
    }

    pub fn emit_progress(&self, value: &Pr) -> Result<u64, JobSpecError> {
        Ok(self.progress()?.publish(value)?)
    }

    pub fn mark_active(&self) -> Result<JobRecord, JobSpecError> {
        self.transition(JobStatus::Active)
    }

    /// Record success and close the output and progress streams.
    pub fn mark_completed(&self) -> Result<JobRecord, JobSpecError> {
        let record = self.transition(JobStatus::Completed)?;
        self.close_streams()?;
        info!(spec = %self.spec.name(), job_id = %self.job_id, "job completed");
        Ok(record)
    }

    /// Record failure and close the output and progress streams.
    pub fn mark_failed(&self, error: impl Into<String>) -> Result<JobRecord, JobSpecError> {
        let error = error.into();
        let record = self.transition(JobStatus::Failed {
            error: error.clone(),
        })?;
        self.close_streams()?;
        warn!(spec = %self.spec.name(), job_id = %self.job_id, %error, "job failed");
        Ok(record)
    }

    fn transition(&self, status: JobStatus) -> Result<JobRecord, JobSpecError> {
        let queue = self.spec.env().queue().ok_or_else(|| {
            JobSpecError::Configuration(format!(
                "environment for project {} has no job queue",
                self.spec.env().project_id()
            ))
        })?;
        Ok(queue.update_status(&self.spec.namespace(), &self.job_id, status)?)
    }

    fn close_streams(&self) -> Result<(), JobSpecError> {
        self.output()?.complete()?;
        self.progress()?.complete()?;
        Ok(())
    }
}
