//! Infrastructure layer: durable stream substrates, queue-submission
//! backends, blob storage and wiring from configuration.

pub mod bootstrap;
pub mod job_queue;
pub mod storage;
pub mod stream_store;

pub use bootstrap::environment_from_config;
pub use storage::LocalDirStorage;
