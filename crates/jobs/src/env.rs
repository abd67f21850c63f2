//! Environment context: the project a spec belongs to and the collaborators
//! it talks to.
//!
//! An environment is built once at start-up and treated as immutable.
//! [`EnvironmentContext::derive`] produces a new value with some fields
//! replaced; the receiver is never touched. Clones share collaborators
//! (they are `Arc`s) but are otherwise independent values.
//!
//! One environment may be designated process-wide with
//! [`EnvironmentContext::set_global`]; specs created without an explicit
//! environment bind to it.

use std::fmt;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use jobwire_core::ProjectId;
use jobwire_streams::{InMemoryStreamStore, PayloadCodec, StorageProvider, StreamSettings, StreamStore};

use crate::in_memory_queue::InMemoryJobQueue;
use crate::queue::JobQueue;
use crate::registry::SpecRegistry;

static GLOBAL: OnceLock<EnvironmentContext> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    #[error("no global environment has been designated")]
    NotConfigured,

    #[error("a global environment is already designated (project {0})")]
    AlreadyDesignated(ProjectId),
}

#[derive(Clone)]
pub struct EnvironmentContext {
    project_id: ProjectId,
    storage: Option<Arc<dyn StorageProvider>>,
    streams: Option<Arc<dyn StreamStore>>,
    queue: Option<Arc<dyn JobQueue>>,
    registry: Arc<SpecRegistry>,
    settings: StreamSettings,
}

/// Fields to replace when deriving an environment. `None` keeps the receiver's value.
#[derive(Clone, Default)]
pub struct EnvOverrides {
    pub project_id: Option<ProjectId>,
    pub storage: Option<Arc<dyn StorageProvider>>,
    pub streams: Option<Arc<dyn StreamStore>>,
    pub queue: Option<Arc<dyn JobQueue>>,
    pub settings: Option<StreamSettings>,
}

impl EnvOverrides {
    pub fn project(project_id: ProjectId) -> Self {
        Self {
            project_id: Some(project_id),
            ..Self::default()
        }
    }
}

impl fmt::Debug for EnvironmentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentContext")
            .field("project_id", &self.project_id)
            .field("has_storage", &self.storage.is_some())
            .field("has_streams", &self.streams.is_some())
            .field("has_queue", &self.queue.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

impl EnvironmentContext {
    /// Environment with no collaborators attached.
    pub fn new(project_id: ProjectId) -> Self {
        Self {
            project_id,
            storage: None,
            streams: None,
            queue: None,
            registry: Arc::new(SpecRegistry::new()),
            settings: StreamSettings::default(),
        }
    }

    /// Self-contained environment backed by in-memory streams and queue.
    pub fn in_memory(project_id: ProjectId) -> Self {
        Self::new(project_id)
            .with_streams(Arc::new(InMemoryStreamStore::new()))
            .with_queue(InMemoryJobQueue::arc())
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageProvider>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_streams(mut self, streams: Arc<dyn StreamStore>) -> Self {
        self.streams = Some(streams);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_settings(mut self, settings: StreamSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn storage(&self) -> Option<&Arc<dyn StorageProvider>> {
        self.storage.as_ref()
    }

    pub fn streams(&self) -> Option<&Arc<dyn StreamStore>> {
        self.streams.as_ref()
    }

    pub fn queue(&self) -> Option<&Arc<dyn JobQueue>> {
        self.queue.as_ref()
    }

    pub fn registry(&self) -> &SpecRegistry {
        &self.registry
    }

    pub fn settings(&self) -> StreamSettings {
        self.settings
    }

    /// Payload codec for streams of this environment.
    pub fn codec(&self) -> PayloadCodec {
        PayloadCodec::new(self.storage.clone(), self.settings)
    }

    /// New environment with `overrides` applied; the receiver is unchanged.
    pub fn derive(&self, overrides: EnvOverrides) -> Self {
        Self {
            project_id: overrides.project_id.unwrap_or_else(|| self.project_id.clone()),
            storage: overrides.storage.or_else(|| self.storage.clone()),
            streams: overrides.streams.or_else(|| self.streams.clone()),
            queue: overrides.queue.or_else(|| self.queue.clone()),
            registry: Arc::clone(&self.registry),
            settings: overrides.settings.unwrap_or(self.settings),
        }
    }

    /// The process-wide environment.
    pub fn global() -> Result<&'static EnvironmentContext, EnvError> {
        GLOBAL.get().ok_or(EnvError::NotConfigured)
    }

    /// Designate the process-wide environment. Only the first call succeeds.
    pub fn set_global(env: EnvironmentContext) -> Result<&'static EnvironmentContext, EnvError> {
        let mut installed = false;
        let global = GLOBAL.get_or_init(|| {
            installed = true;
            env
        });

        if installed {
            tracing::info!(project_id = %global.project_id, "global environment designated");
            Ok(global)
        } else {
            Err(EnvError::AlreadyDesignated(global.project_id.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobwire_streams::InMemoryStorage;

    fn project(id: &str) -> ProjectId {
        ProjectId::parse(id).unwrap()
    }

    #[test]
    fn derive_replaces_only_given_fields() {
        let base = EnvironmentContext::in_memory(project("base"));
        let derived = base.derive(EnvOverrides {
            project_id: Some(project("derived")),
            storage: Some(Arc::new(InMemoryStorage::new())),
            ..EnvOverrides::default()
        });

        assert_eq!(derived.project_id().as_str(), "derived");
        assert!(derived.storage().is_some());
        assert!(Arc::ptr_eq(derived.streams().unwrap(), base.streams().unwrap()));
        assert!(Arc::ptr_eq(derived.queue().unwrap(), base.queue().unwrap()));

        assert_eq!(base.project_id().as_str(), "base");
        assert!(base.storage().is_none());
    }

    #[test]
    fn derive_with_no_overrides_is_an_equal_copy() {
        let base = EnvironmentContext::new(project("p")).with_settings(StreamSettings {
            offload_threshold_bytes: 1,
        });
        let copy = base.derive(EnvOverrides::default());

        assert_eq!(copy.project_id(), base.project_id());
        assert_eq!(copy.settings(), base.settings());
        assert!(copy.streams().is_none() && copy.queue().is_none());
    }

    #[test]
    fn debug_output_does_not_require_debug_collaborators() {
        let env = EnvironmentContext::in_memory(project("p"));
        let rendered = format!("{env:?}");
        assert!(rendered.contains("has_streams: true"));
    }
}
