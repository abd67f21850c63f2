//! Durable [`JobQueue`](jobwire_jobs::JobQueue) backends.
//!
//! - [`PostgresJobQueue`]: job records in Postgres (`DATABASE_URL`)
//! - `RedisJobQueue`: records plus a pending-work stream in Redis (feature `redis`)
//!
//! [`JobQuery`] adds paginated listing for inspection tooling.

pub mod postgres;
pub mod query;
#[cfg(feature = "redis")]
pub mod redis_queue;

pub use postgres::{BlockingRuntime, PostgresJobQueue};
pub use query::{JobFilter, JobPage, JobQuery, Pagination};
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
