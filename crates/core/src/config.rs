//! Process configuration read from environment variables.

use std::path::PathBuf;

use tracing::warn;

use crate::error::KeyError;
use crate::id::ProjectId;

/// Values above this size (serialized bytes) are offloaded to blob storage
/// when a storage provider is configured.
pub const DEFAULT_OFFLOAD_THRESHOLD_BYTES: usize = 10 * 1024;

pub const PROJECT_ID_VAR: &str = "JOBWIRE_PROJECT_ID";
pub const REDIS_URL_VAR: &str = "REDIS_URL";
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";
pub const STORAGE_DIR_VAR: &str = "JOBWIRE_STORAGE_DIR";
pub const OFFLOAD_THRESHOLD_VAR: &str = "JOBWIRE_OFFLOAD_THRESHOLD_BYTES";
pub const STREAM_MAX_LEN_VAR: &str = "JOBWIRE_STREAM_MAX_LEN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub project_id: ProjectId,
    /// Durable stream substrate + queue connection.
    pub redis_url: Option<String>,
    /// Job record database.
    pub database_url: Option<String>,
    /// Root directory for offloaded blobs.
    pub storage_dir: Option<PathBuf>,
    pub offload_threshold_bytes: usize,
    /// Approximate cap on retained stream history (`None` = keep everything).
    pub stream_max_len: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}: {source}")]
    InvalidProjectId {
        var: &'static str,
        #[source]
        source: KeyError,
    },

    #[error("invalid {var}: expected an unsigned integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

impl EnvConfig {
    /// Minimal in-process configuration (no external services).
    pub fn local(project_id: ProjectId) -> Self {
        Self {
            project_id,
            redis_url: None,
            database_url: None,
            storage_dir: None,
            offload_threshold_bytes: DEFAULT_OFFLOAD_THRESHOLD_BYTES,
            stream_max_len: None,
        }
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let project_id = match non_empty(PROJECT_ID_VAR) {
            Some(raw) => ProjectId::parse(raw).map_err(|source| ConfigError::InvalidProjectId {
                var: PROJECT_ID_VAR,
                source,
            })?,
            None => {
                let generated = format!("jobwire-{}", chrono::Utc::now().timestamp_millis());
                warn!(project_id = %generated, "JOBWIRE_PROJECT_ID not set; using a generated project id");
                ProjectId::parse(generated).map_err(|source| ConfigError::InvalidProjectId {
                    var: PROJECT_ID_VAR,
                    source,
                })?
            }
        };

        let offload_threshold_bytes = match non_empty(OFFLOAD_THRESHOLD_VAR) {
            Some(raw) => parse_usize(OFFLOAD_THRESHOLD_VAR, &raw)?,
            None => DEFAULT_OFFLOAD_THRESHOLD_BYTES,
        };

        let stream_max_len = non_empty(STREAM_MAX_LEN_VAR)
            .map(|raw| parse_usize(STREAM_MAX_LEN_VAR, &raw))
            .transpose()?;

        Ok(Self {
            project_id,
            redis_url: non_empty(REDIS_URL_VAR),
            database_url: non_empty(DATABASE_URL_VAR),
            storage_dir: non_empty(STORAGE_DIR_VAR).map(PathBuf::from),
            offload_threshold_bytes,
            stream_max_len,
        })
    }
}

fn parse_usize(var: &'static str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn reads_every_variable() {
        let cfg = EnvConfig::from_lookup(lookup(&[
            (PROJECT_ID_VAR, "media"),
            (REDIS_URL_VAR, "redis://localhost:6379"),
            (DATABASE_URL_VAR, "postgres://localhost/jobs"),
            (STORAGE_DIR_VAR, "/tmp/blobs"),
            (OFFLOAD_THRESHOLD_VAR, "2048"),
            (STREAM_MAX_LEN_VAR, "500"),
        ]))
        .unwrap();

        assert_eq!(cfg.project_id.as_str(), "media");
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/jobs"));
        assert_eq!(cfg.storage_dir, Some(PathBuf::from("/tmp/blobs")));
        assert_eq!(cfg.offload_threshold_bytes, 2048);
        assert_eq!(cfg.stream_max_len, Some(500));
    }

    #[test]
    fn missing_project_id_is_generated() {
        let cfg = EnvConfig::from_lookup(lookup(&[])).unwrap();
        assert!(cfg.project_id.as_str().starts_with("jobwire-"));
        assert_eq!(cfg.offload_threshold_bytes, DEFAULT_OFFLOAD_THRESHOLD_BYTES);
        assert!(cfg.redis_url.is_none());
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = EnvConfig::from_lookup(lookup(&[(OFFLOAD_THRESHOLD_VAR, "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));
    }
}
