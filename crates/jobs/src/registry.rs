//! Per-environment record of which schemas each spec name was created with.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::RwLock;

use jobwire_core::{ProjectId, Schema, SpecName};

/// The four schema types of a spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecSignature {
    types: [TypeId; 4],
    names: [&'static str; 4],
}

impl SpecSignature {
    pub fn of<P: Schema, I: Schema, O: Schema, Pr: Schema>() -> Self {
        Self {
            types: [
                TypeId::of::<P>(),
                TypeId::of::<I>(),
                TypeId::of::<O>(),
                TypeId::of::<Pr>(),
            ],
            names: [
                P::schema_name(),
                I::schema_name(),
                O::schema_name(),
                Pr::schema_name(),
            ],
        }
    }

    pub fn params(&self) -> &'static str {
        self.names[0]
    }

    pub fn input(&self) -> &'static str {
        self.names[1]
    }

    pub fn output(&self) -> &'static str {
        self.names[2]
    }

    pub fn progress(&self) -> &'static str {
        self.names[3]
    }
}

impl std::fmt::Display for SpecSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "params={}, input={}, output={}, progress={}",
            self.params(),
            self.input(),
            self.output(),
            self.progress()
        )
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("spec {spec} in project {project_id} already exists with different schemas ({existing}); requested ({requested})")]
pub struct RegistryConflict {
    pub project_id: ProjectId,
    pub spec: SpecName,
    pub existing: SpecSignature,
    pub requested: SpecSignature,
}

#[derive(Debug, Default)]
pub struct SpecRegistry {
    specs: RwLock<HashMap<(ProjectId, SpecName), SpecSignature>>,
}

impl SpecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a spec. Re-registering the same signature is a no-op.
    pub fn register(
        &self,
        project_id: &ProjectId,
        spec: &SpecName,
        signature: SpecSignature,
    ) -> Result<(), RegistryConflict> {
        // A poisoned registry still holds consistent data: entries are only ever inserted whole.
        let mut specs = self.specs.write().unwrap_or_else(|e| e.into_inner());
        let key = (project_id.clone(), spec.clone());

        match specs.get(&key) {
            Some(existing) if *existing != signature => Err(RegistryConflict {
                project_id: project_id.clone(),
                spec: spec.clone(),
                existing: *existing,
                requested: signature,
            }),
            Some(_) => Ok(()),
            None => {
                specs.insert(key, signature);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, project_id: &ProjectId, spec: &SpecName) -> Option<SpecSignature> {
        let specs = self.specs.read().unwrap_or_else(|e| e.into_inner());
        specs.get(&(project_id.clone(), spec.clone())).copied()
    }

    /// Names of every spec registered for a project, sorted.
    pub fn spec_names(&self, project_id: &ProjectId) -> Vec<SpecName> {
        let specs = self.specs.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<SpecName> = specs
            .keys()
            .filter(|(p, _)| p == project_id)
            .map(|(_, s)| s.clone())
            .collect();
        names.sort();
        names
    }
}
