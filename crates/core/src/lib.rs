//! `jobwire-core`: shared building blocks for job specs and streams.
//!
//! This crate contains identifiers, the schema/validation contract and
//! configuration. It has no knowledge of any substrate.

pub mod config;
pub mod error;
pub mod id;
pub mod schema;

pub use config::{ConfigError, EnvConfig};
pub use error::{KeyError, ValidationError, Violation};
pub use id::{JobId, ProjectId, SpecName, StreamId, StreamKey, StreamType};
pub use schema::{NoProgress, Schema};
