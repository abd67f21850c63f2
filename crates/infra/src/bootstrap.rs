//! Build an [`EnvironmentContext`] from [`EnvConfig`].
//!
//! | Setting | Backend |
//! |---------|---------|
//! | `REDIS_URL` (feature `redis`) | `RedisStreamStore`, otherwise `InMemoryStreamStore` |
//! | `DATABASE_URL` | [`PostgresJobQueue`], else `RedisJobQueue` with Redis, else `InMemoryJobQueue` |
//! | `JOBWIRE_STORAGE_DIR` | [`LocalDirStorage`], otherwise values stay inline |

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use jobwire_core::EnvConfig;
use jobwire_jobs::{EnvironmentContext, InMemoryJobQueue, JobQueue};
use jobwire_streams::{InMemoryStreamStore, StreamSettings, StreamStore};

use crate::job_queue::PostgresJobQueue;
use crate::storage::LocalDirStorage;

/// Wire every backend named by `config` into a new environment.
///
/// Connections are checked eagerly, so a bad URL fails here rather than on
/// first publish.
pub fn environment_from_config(config: &EnvConfig) -> anyhow::Result<EnvironmentContext> {
    let settings = StreamSettings {
        offload_threshold_bytes: config.offload_threshold_bytes,
    };

    let mut env = EnvironmentContext::new(config.project_id.clone())
        .with_settings(settings)
        .with_streams(stream_store(config)?)
        .with_queue(job_queue(config)?);

    if let Some(dir) = &config.storage_dir {
        let storage = LocalDirStorage::new(dir)
            .with_context(|| format!("failed to open blob storage at {}", dir.display()))?;
        env = env.with_storage(Arc::new(storage));
    }

    info!(project_id = %config.project_id, environment = ?env, "environment ready");
    Ok(env)
}

#[cfg(feature = "redis")]
fn stream_store(config: &EnvConfig) -> anyhow::Result<Arc<dyn StreamStore>> {
    use crate::stream_store::RedisStreamStore;

    if let Some(url) = &config.redis_url {
        let store = RedisStreamStore::new(url, config.stream_max_len)
            .context("failed to create Redis stream store")?;
        store.ping().context("Redis is not reachable")?;
        return Ok(Arc::new(store));
    }
    Ok(in_memory_streams(config))
}

#[cfg(not(feature = "redis"))]
fn stream_store(config: &EnvConfig) -> anyhow::Result<Arc<dyn StreamStore>> {
    if config.redis_url.is_some() {
        warn!("REDIS_URL is set but Redis support is not compiled in; streams stay in memory");
    }
    Ok(in_memory_streams(config))
}

fn in_memory_streams(config: &EnvConfig) -> Arc<dyn StreamStore> {
    match config.stream_max_len {
        Some(max) => Arc::new(InMemoryStreamStore::with_max_history(max)),
        None => Arc::new(InMemoryStreamStore::new()),
    }
}

fn job_queue(config: &EnvConfig) -> anyhow::Result<Arc<dyn JobQueue>> {
    if let Some(url) = &config.database_url {
        let queue = PostgresJobQueue::connect_blocking(url)
            .context("failed to connect the Postgres job queue")?;
        return Ok(Arc::new(queue));
    }

    if let Some(queue) = redis_job_queue(config)? {
        return Ok(queue);
    }

    warn!("no DATABASE_URL configured; job records are kept in memory");
    Ok(InMemoryJobQueue::arc())
}

#[cfg(feature = "redis")]
fn redis_job_queue(config: &EnvConfig) -> anyhow::Result<Option<Arc<dyn JobQueue>>> {
    let Some(url) = &config.redis_url else {
        return Ok(None);
    };
    let queue = crate::job_queue::RedisJobQueue::new(url).context("failed to create Redis job queue")?;
    Ok(Some(Arc::new(queue)))
}

#[cfg(not(feature = "redis"))]
fn redis_job_queue(_config: &EnvConfig) -> anyhow::Result<Option<Arc<dyn JobQueue>>> {
    Ok(None)
}
