//! Networked stream substrates.
//!
//! The in-memory substrate lives in `jobwire-streams`; this module adds
//! implementations that outlive the process.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamStore;
