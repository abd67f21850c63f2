//! Typed job specifications.
//!
//! A [`JobSpec`] is a named contract between job submitters and workers:
//!
//! - `P`: parameters, validated before anything is submitted
//! - `I`: values fed to a running job on its input stream
//! - `O`: values the job publishes on its output stream(s)
//! - `Pr`: progress reports (defaults to [`NoProgress`])
//!
//! Streams of a job are addressed by `(job id, stream type, sub-key)` and
//! created on first use. Submitting a job never creates a stream.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, instrument};

use jobwire_core::{
    JobId, KeyError, NoProgress, Schema, SpecName, StreamKey, StreamType, ValidationError,
};
use jobwire_streams::{
    Datapoint, Delivery, ReadOrder, ReplayFrom, Stream, StreamError, StreamStore, Subscription,
};

use crate::env::{EnvError, EnvironmentContext};
use crate::handle::JobHandle;
use crate::queue::{JobNamespace, JobQueue, JobRecord, JobStatus, JobSubmission, QueueError, SubmissionOptions};
use crate::registry::SpecSignature;

#[derive(Debug, Error)]
pub enum JobSpecError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("job {job_id} already exists for spec {spec}")]
    DuplicateJob { spec: SpecName, job_id: JobId },

    #[error("invalid stream key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error(transparent)]
    Queue(QueueError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("no output from job {job_id} within {waited:?}")]
    Timeout { job_id: JobId, waited: Duration },
}

impl From<QueueError> for JobSpecError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Duplicate { namespace, job_id } => JobSpecError::DuplicateJob {
                spec: namespace.spec,
                job_id,
            },
            other => JobSpecError::Queue(other),
        }
    }
}

impl From<EnvError> for JobSpecError {
    fn from(err: EnvError) -> Self {
        JobSpecError::Configuration(err.to_string())
    }
}

pub struct JobSpec<P, I, O, Pr = NoProgress> {
    name: SpecName,
    env: EnvironmentContext,
    _schemas: PhantomData<fn() -> (P, I, O, Pr)>,
}

impl<P, I, O, Pr> Clone for JobSpec<P, I, O, Pr> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            env: self.env.clone(),
            _schemas: PhantomData,
        }
    }
}

impl<P, I, O, Pr> fmt::Debug for JobSpec<P, I, O, Pr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSpec")
            .field("name", &self.name)
            .field("project_id", self.env.project_id())
            .finish()
    }
}

impl<P, I, O, Pr> JobSpec<P, I, O, Pr>
where
    P: Schema,
    I: Schema,
    O: Schema,
    Pr: Schema,
{
    /// Bind a spec to `env`, or to the global environment when `env` is `None`.
    pub fn create(name: &str, env: Option<EnvironmentContext>) -> Result<Self, JobSpecError> {
        let name = SpecName::parse(name)
            .map_err(|e| JobSpecError::Configuration(format!("invalid spec name: {e}")))?;

        let env = match env {
            Some(env) => env,
            None => EnvironmentContext::global()?.clone(),
        };

        env.registry()
            .register(env.project_id(), &name, SpecSignature::of::<P, I, O, Pr>())
            .map_err(|e| JobSpecError::Configuration(e.to_string()))?;

        debug!(spec = %name, project_id = %env.project_id(), "job spec created");
        Ok(Self {
            name,
            env,
            _schemas: PhantomData,
        })
    }

    pub fn name(&self) -> &SpecName {
        &self.name
    }

    pub fn env(&self) -> &EnvironmentContext {
        &self.env
    }

    pub fn namespace(&self) -> JobNamespace {
        JobNamespace::new(self.env.project_id().clone(), self.name.clone())
    }

    /// Coerce raw parameters into `P` and check its invariants.
    pub fn validate_params(&self, raw: JsonValue) -> Result<P, ValidationError> {
        P::parse_value(raw)
    }

    /// Validate `params` and submit them under `job_id`.
    ///
    /// Nothing reaches the queue if validation fails.
    #[instrument(skip(self, params, options), fields(spec = %self.name, job_id = %job_id), err)]
    pub fn request_job(
        &self,
        job_id: JobId,
        params: JsonValue,
        options: Option<SubmissionOptions>,
    ) -> Result<JobId, JobSpecError> {
        let validated = self.validate_params(params)?;
        let queue = self.queue()?;

        let submission = JobSubmission {
            namespace: self.namespace(),
            job_id,
            params: validated.to_json()?,
            options: options.unwrap_or_default(),
            submitted_at: Utc::now(),
        };

        let accepted = queue.submit(submission)?;
        info!("job submitted");
        Ok(accepted)
    }

    /// Typed variant of [`JobSpec::request_job`].
    pub fn submit(
        &self,
        job_id: JobId,
        params: &P,
        options: Option<SubmissionOptions>,
    ) -> Result<JobId, JobSpecError> {
        self.request_job(job_id, params.to_json()?, options)
    }

    /// Submit with a generated job id.
    pub fn enqueue(&self, params: &P) -> Result<JobId, JobSpecError> {
        self.submit(JobId::generate(&self.name), params, None)
    }

    /// Resolve the stream of a job for the given type and sub-key.
    pub fn get_job_stream<V: Schema>(
        &self,
        job_id: &JobId,
        stream_type: StreamType,
        sub_key: Option<&str>,
    ) -> Result<Stream<V>, JobSpecError> {
        let key = StreamKey::new(
            self.env.project_id().clone(),
            self.name.clone(),
            job_id.clone(),
            stream_type,
            sub_key.map(str::to_string),
        )?;
        let store = self.streams()?;
        Ok(Stream::new(key.stream_id(), store, self.env.codec()))
    }

    pub fn input_stream(&self, job_id: &JobId) -> Result<Stream<I>, JobSpecError> {
        self.get_job_stream(job_id, StreamType::Input, None)
    }

    pub fn output_stream(&self, job_id: &JobId, sub_key: Option<&str>) -> Result<Stream<O>, JobSpecError> {
        self.get_job_stream(job_id, StreamType::Output, sub_key)
    }

    pub fn progress_stream(&self, job_id: &JobId) -> Result<Stream<Pr>, JobSpecError> {
        self.get_job_stream(job_id, StreamType::Progress, None)
    }

    /// Output values of a job: history first (per `from`), then live values
    /// until the stream completes.
    pub fn for_job_output(
        &self,
        job_id: &JobId,
        sub_key: Option<&str>,
        from: ReplayFrom,
    ) -> Result<Subscription<O>, JobSpecError> {
        Ok(self.output_stream(job_id, sub_key)?.replay(from)?)
    }

    /// Publish a value on a job's input stream.
    pub fn feed_job_input(&self, job_id: &JobId, data: &I) -> Result<u64, JobSpecError> {
        Ok(self.input_stream(job_id)?.publish(data)?)
    }

    /// Close a job's input stream.
    pub fn terminate_job_input(&self, job_id: &JobId) -> Result<(), JobSpecError> {
        Ok(self.input_stream(job_id)?.complete()?)
    }

    pub fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>, JobSpecError> {
        Ok(self.queue()?.get(&self.namespace(), job_id)?)
    }

    pub fn get_job_status(&self, job_id: &JobId) -> Result<Option<JobStatus>, JobSpecError> {
        Ok(self.get_job(job_id)?.map(|r| r.status))
    }

    /// Retained values of one of a job's streams.
    pub fn get_job_data<V: Schema>(
        &self,
        job_id: &JobId,
        stream_type: StreamType,
        order: ReadOrder,
        limit: usize,
    ) -> Result<Vec<Datapoint<V>>, JobSpecError> {
        Ok(self
            .get_job_stream::<V>(job_id, stream_type, None)?
            .history(order, limit)?)
    }

    /// Submit with a generated id and wait for the job's first output.
    ///
    /// Once a value arrives the job's input stream is terminated. Returns
    /// `None` if the output stream completes without a value.
    #[instrument(skip(self, params), fields(spec = %self.name), err)]
    pub fn enqueue_and_wait_for_output(
        &self,
        params: &P,
        timeout: Duration,
    ) -> Result<(JobId, Option<O>), JobSpecError> {
        // Nothing is created unless the job can actually be submitted.
        self.validate_params(params.to_json()?)?;
        self.queue()?;
        self.streams()?;

        let job_id = JobId::generate(&self.name);
        // Subscribe before submitting so a fast worker cannot be missed.
        let mut outputs = self.for_job_output(&job_id, None, ReplayFrom::Beginning)?;
        self.submit(job_id.clone(), params, None)?;

        match outputs.recv_timeout(timeout)? {
            Some(Delivery::Value(point)) => {
                self.terminate_job_input(&job_id)?;
                Ok((job_id, Some(point.value)))
            }
            Some(Delivery::Completed) => Ok((job_id, None)),
            None => Err(JobSpecError::Timeout {
                job_id,
                waited: timeout,
            }),
        }
    }

    /// Per-job view for workers.
    pub fn job(&self, job_id: JobId) -> JobHandle<P, I, O, Pr> {
        JobHandle::new(self.clone(), job_id)
    }

    fn queue(&self) -> Result<Arc<dyn JobQueue>, JobSpecError> {
        self.env.queue().cloned().ok_or_else(|| {
            JobSpecError::Configuration(format!(
                "environment for project {} has no job queue",
                self.env.project_id()
            ))
        })
    }

    fn streams(&self) -> Result<Arc<dyn StreamStore>, JobSpecError> {
        self.env.streams().cloned().ok_or_else(|| {
            JobSpecError::Configuration(format!(
                "environment for project {} has no stream store",
                self.env.project_id()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobwire_core::{ProjectId, Violation};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Resize {
        width: u32,
    }

    impl Schema for Resize {
        fn validate(&self) -> Result<(), Vec<Violation>> {
            if self.width == 0 {
                return Err(vec![Violation::field("width", "must be positive")]);
            }
            Ok(())
        }
    }

    type ResizeSpec = JobSpec<Resize, JsonValue, JsonValue>;

    fn env() -> EnvironmentContext {
        EnvironmentContext::in_memory(ProjectId::parse("proj").unwrap())
    }

    fn job(id: &str) -> JobId {
        JobId::parse(id).unwrap()
    }

    #[test]
    fn invalid_spec_name_is_a_configuration_error() {
        let err = ResizeSpec::create("bad name", Some(env())).unwrap_err();
        assert!(matches!(err, JobSpecError::Configuration(_)));
    }

    #[test]
    fn missing_queue_is_a_configuration_error() {
        let env = EnvironmentContext::new(ProjectId::parse("proj").unwrap());
        let spec = ResizeSpec::create("resize", Some(env)).unwrap();

        let err = spec.request_job(job("j1"), json!({"width": 10}), None).unwrap_err();
        assert!(matches!(err, JobSpecError::Configuration(msg) if msg.contains("no job queue")));

        let err = spec.output_stream(&job("j1"), None).unwrap_err();
        assert!(matches!(err, JobSpecError::Configuration(msg) if msg.contains("no stream store")));
    }

    #[test]
    fn request_job_normalizes_params() {
        let spec = ResizeSpec::create("resize", Some(env())).unwrap();
        spec.request_job(job("j1"), json!({"width": 10, "ignored": true}), None)
            .unwrap();

        let record = spec.get_job(&job("j1")).unwrap().unwrap();
        assert_eq!(record.params, json!({"width": 10}));
    }

    #[test]
    fn custom_stream_types_and_sub_keys_are_separate_streams() {
        let spec = ResizeSpec::create("resize", Some(env())).unwrap();
        let a = spec
            .get_job_stream::<JsonValue>(&job("j1"), StreamType::Output, Some("thumbs"))
            .unwrap();
        let b = spec
            .get_job_stream::<JsonValue>(&job("j1"), StreamType::custom("logs").unwrap(), None)
            .unwrap();

        a.publish(&json!(1)).unwrap();
        assert_eq!(a.id().as_str(), "proj/resize/j1/output/thumbs");
        assert_eq!(b.id().as_str(), "proj/resize/j1/logs");
        assert_eq!(b.get_last_value().unwrap(), None);
    }

    #[test]
    fn malformed_sub_key_is_an_invalid_key() {
        let spec = ResizeSpec::create("resize", Some(env())).unwrap();
        let err = spec.output_stream(&job("j1"), Some("a/b")).unwrap_err();
        assert!(matches!(err, JobSpecError::InvalidKey(_)));
    }
}
