//! Public entry point tying the cache, the effects, and the environment manager together.

use std::sync::Arc;

use anyhow::Result;
use pybox_domain::{Platform, ResolvedRelease, VersionConstraint};
use pybox_store::{CacheStore, RuntimeInstallation};

use crate::config::EngineConfig;
use crate::effects::{Effects, SystemEffects};
use crate::environment::{EnvOptions, EnvironmentManager, Provisioned, VirtualEnvironment};
use crate::runner::EnvRunner;
use crate::runtime::RuntimeMaterializer;

pub struct Provisioner {
    config: EngineConfig,
    store: CacheStore,
    effects: Arc<dyn Effects>,
}

impl Provisioner {
    /// Provisioner for the host platform backed by HTTP and real subprocesses.
    ///
    /// # Errors
    /// [`pybox_domain::ProvisionError::UnsupportedPlatform`] on hosts without published builds,
    /// or a failure to build the HTTP client.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let effects = Arc::new(SystemEffects::new(&config)?);
        Self::with_effects(config, effects)
    }

    pub fn with_effects(config: EngineConfig, effects: Arc<dyn Effects>) -> Result<Self> {
        let platform = Platform::current()?;
        Ok(Self::with_platform(config, effects, platform))
    }

    /// Provisioner for an explicit platform.
    #[must_use]
    pub fn with_platform(
        config: EngineConfig,
        effects: Arc<dyn Effects>,
        platform: &'static Platform,
    ) -> Self {
        let store = CacheStore::new(config.cache_root.clone(), platform);
        Self {
            config,
            store,
            effects,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Return a runner for the named environment, building or repairing it as needed.
    pub fn get_or_create(&self, options: &EnvOptions) -> Result<EnvRunner> {
        let provisioned = self.provision(options)?;
        self.runner(provisioned.env)
    }

    /// Like [`Provisioner::get_or_create`], but reports what was done instead of a runner.
    pub fn provision(&self, options: &EnvOptions) -> Result<Provisioned> {
        self.environments().get_or_create(options)
    }

    pub fn remove_environment(&self, name: &str) -> Result<bool> {
        self.environments().remove(name)
    }

    pub fn list_environments(&self) -> Result<Vec<VirtualEnvironment>> {
        self.environments().list()
    }

    /// Runner for an existing valid environment; `None` when it is absent or incomplete.
    pub fn find_environment(&self, name: &str) -> Result<Option<EnvRunner>> {
        self.environments()
            .find(name)?
            .map(|env| self.runner(env))
            .transpose()
    }

    pub fn installed_runtimes(&self) -> Result<Vec<RuntimeInstallation>> {
        self.store.list_installations()
    }

    /// Make sure a runtime satisfying `constraint` is installed.
    pub fn ensure_runtime(&self, constraint: &str) -> Result<RuntimeInstallation> {
        let constraint = VersionConstraint::parse(constraint)?;
        self.runtimes().ensure(&constraint)
    }

    /// Resolve `constraint` against the release registry without downloading anything.
    pub fn resolve(&self, constraint: &str) -> Result<ResolvedRelease> {
        let constraint = VersionConstraint::parse(constraint)?;
        self.runtimes().resolve(&constraint)
    }

    fn environments(&self) -> EnvironmentManager<'_> {
        EnvironmentManager::new(&self.store, self.effects.as_ref(), &self.config)
    }

    fn runtimes(&self) -> RuntimeMaterializer<'_> {
        RuntimeMaterializer::new(&self.store, self.effects.as_ref(), &self.config)
    }

    fn runner(&self, env: VirtualEnvironment) -> Result<EnvRunner> {
        EnvRunner::new(
            env,
            self.store.platform(),
            Arc::clone(&self.effects),
            &self.config.subprocess_env,
        )
    }
}
