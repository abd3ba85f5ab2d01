//! Source registry
//!
//! Built once by whoever drives the engine and handed to the
//! [`Orchestrator`](crate::orchestrator::Orchestrator). Registering a module
//! checks its descriptor and provisions it.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::RegistryError;
use crate::lock::platform_lock_check;
use crate::module::{ModuleState, SourceModule};
use crate::source;
use crate::storage::TieredStore;

/// The set of registered source modules, in registration order
#[derive(Debug, Default)]
pub struct Registry {
    modules: Vec<SourceModule>,
    ids: BTreeSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build modules for every configured source
    ///
    /// Sources that fail registration are skipped and reported alongside the
    /// registry.
    pub fn from_config(config: &Config, store: &TieredStore) -> (Self, Vec<RegistryError>) {
        let mut registry = Self::new();
        let mut errors = Vec::new();

        for source_config in &config.sources {
            let (descriptor, reader) = source::from_config(config, source_config);
            let wants_lock_check = descriptor.capabilities.lock_check;
            let mut module = SourceModule::new(descriptor, reader, store.clone());
            if wants_lock_check {
                match platform_lock_check() {
                    Some(check) => module = module.with_lock_check(check),
                    None => warn!(source = %source_config.name, "lock check unsupported on this platform"),
                }
            }
            if let Err(e) = registry.register(module) {
                warn!(error = %e, "source not registered");
                errors.push(e);
            }
        }

        (registry, errors)
    }

    /// Add a module and provision it
    pub fn register(&mut self, mut module: SourceModule) -> Result<(), RegistryError> {
        let id = module.id().to_string();
        if id.trim().is_empty() {
            return Err(RegistryError::MissingId);
        }
        if self.ids.contains(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        if module.state() != ModuleState::Unregistered || module.provision().is_err() {
            return Err(RegistryError::AlreadyProvisioned(id));
        }

        debug!(source = %id, kind = %module.descriptor().kind, "registered");
        self.ids.insert(id);
        self.modules.push(module);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(SourceModule::id)
    }

    pub fn get(&self, id: &str) -> Option<&SourceModule> {
        self.modules.iter().find(|m| m.id() == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SourceModule> {
        self.modules.iter_mut().find(|m| m.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceModule> {
        self.modules.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SourceModule> {
        self.modules.iter_mut()
    }

    pub fn into_modules(self) -> Vec<SourceModule> {
        self.modules
    }
}
