//! Ensuring a runtime installation exists for a constraint.

use anyhow::Result;
use pybox_domain::{ResolvedRelease, VersionConstraint};
use pybox_store::{CacheStore, RuntimeInstallation};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::effects::Effects;
use crate::fetcher::ArtifactFetcher;
use crate::resolver::VersionResolver;

pub(crate) struct RuntimeMaterializer<'a> {
    store: &'a CacheStore,
    effects: &'a dyn Effects,
    config: &'a EngineConfig,
}

impl<'a> RuntimeMaterializer<'a> {
    pub(crate) fn new(
        store: &'a CacheStore,
        effects: &'a dyn Effects,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            store,
            effects,
            config,
        }
    }

    /// An absent constraint always asks the registry for the latest release.
    pub(crate) fn ensure(&self, constraint: &VersionConstraint) -> Result<RuntimeInstallation> {
        if self.config.prefer_cached_runtimes && !constraint.is_latest() {
            if let Some(found) = self.store.find_installation(constraint)? {
                debug!(version = %found.version, %constraint, "reusing cached python runtime");
                return Ok(found);
            }
        }
        let release = self.resolve(constraint)?;
        self.install(&release)
    }

    pub(crate) fn resolve(&self, constraint: &VersionConstraint) -> Result<ResolvedRelease> {
        VersionResolver::new(self.effects.registry(), self.store.platform()).resolve(constraint)
    }

    /// Install `release` under its per-version lock, reusing a valid installation left by
    /// another process and clearing an invalid one.
    pub(crate) fn install(&self, release: &ResolvedRelease) -> Result<RuntimeInstallation> {
        let dir = self.store.installation_dir(&release.version);
        self.store.with_lock(&dir, &self.config.lock, || {
            if let Some(existing) = self.store.installation(&release.version) {
                debug!(version = %existing.version, "python runtime already installed");
                return Ok(existing);
            }
            if self.store.remove_dir(&dir)? {
                warn!(version = %release.version, "removed incomplete python runtime");
            }
            ArtifactFetcher::new(self.effects.downloader()).fetch_and_extract(release, self.store)
        })
    }
}
