use std::sync::Arc;

use anyhow::Result;

use crate::{
    config::Settings,
    error::FlakeError,
    eval::Evaluator,
    fetch::{Fetcher, VersionControl},
    flakeref::FlakeRef,
    registry::{GlobalRegistry, Registries, Registry},
    resolver,
    storage::Store,
};

/// Everything flake resolution needs from the outside world
pub struct FlakeContext {
    settings: Settings,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn Store>,
    evaluator: Arc<dyn Evaluator>,
    vcs: Arc<dyn VersionControl>,
    overrides: Arc<Registry>,
    global_registry: Arc<GlobalRegistry>,
}

impl FlakeContext {
    pub fn new(
        settings: Settings,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn Store>,
        evaluator: Arc<dyn Evaluator>,
        vcs: Arc<dyn VersionControl>,
    ) -> Self {
        Self {
            settings,
            fetcher,
            store,
            evaluator,
            vcs,
            overrides: Arc::new(Registry::new()),
            global_registry: GlobalRegistry::process(),
        }
    }

    /// Registry consulted before all others
    pub fn with_registry_overrides(mut self, overrides: Registry) -> Self {
        self.overrides = Arc::new(overrides);
        self
    }

    /// Use a private global-registry cache instead of the process-wide one
    pub fn with_global_registry(mut self, global_registry: Arc<GlobalRegistry>) -> Self {
        self.global_registry = global_registry;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn fetcher(&self) -> &dyn Fetcher {
        self.fetcher.as_ref()
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn evaluator(&self) -> &dyn Evaluator {
        self.evaluator.as_ref()
    }

    pub fn vcs(&self) -> &dyn VersionControl {
        self.vcs.as_ref()
    }

    /// The user registry as currently on disk
    pub fn user_registry(&self) -> Result<Registry> {
        Registry::load(&self.settings.user_registry_path)
    }

    /// Overrides, then the user registry, then the global registry.
    pub fn registries(&self) -> Result<Registries> {
        Ok(vec![
            self.overrides.clone(),
            Arc::new(self.user_registry()?),
            self.global_registry
                .get(&self.settings, self.fetcher(), self.store())?,
        ])
    }

    /// Resolve `flake_ref` if it is indirect. The registry chain is only
    /// assembled when a lookup actually happens.
    pub fn lookup(&self, flake_ref: &FlakeRef, allow_lookup: bool) -> Result<FlakeRef> {
        if flake_ref.is_direct() {
            return Ok(flake_ref.clone());
        }
        if !allow_lookup {
            return Err(FlakeError::LookupNotAllowed(flake_ref.clone()).into());
        }
        resolver::maybe_resolve(flake_ref, &self.registries()?, true)
    }
}
