//! `jobwire-jobs`: typed job specifications bound to an environment.
//!
//! ## Components
//!
//! - `EnvironmentContext`: project id plus the stream substrate, queue and
//!   blob storage a spec works against
//! - `JobSpec`: named contract of parameter/input/output/progress schemas;
//!   validates and submits jobs, resolves their streams
//! - `JobQueue`: queue-submission primitive (the queue engine lives elsewhere)
//! - `JobHandle`: per-job view used by workers to publish and report status

pub mod env;
pub mod handle;
pub mod in_memory_queue;
pub mod queue;
pub mod registry;
pub mod spec;

pub use env::{EnvError, EnvOverrides, EnvironmentContext};
pub use handle::JobHandle;
pub use in_memory_queue::InMemoryJobQueue;
pub use queue::{
    JobNamespace, JobQueue, JobRecord, JobStatus, JobSubmission, QueueError, SubmissionOptions,
    check_transition,
};
pub use registry::{RegistryConflict, SpecRegistry, SpecSignature};
pub use spec::{JobSpec, JobSpecError};
