//! On-disk cache of python runtimes and virtual environments.
//!
//! Layout under the cache root:
//!
//! ```text
//! python/<version>/          extracted runtime installation
//! python/<version>.lock      per-version lock
//! python/.stage-*            in-flight extraction directories
//! venv/<name>/pyvenv.cfg     virtual environment bound to one runtime
//! venv/<name>.lock           per-environment lock
//! ```
//!
//! Every other component reaches cache paths through [`CacheStore`].

#![deny(clippy::all, warnings)]

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use pybox_domain::{
    descending, descriptor_version, Platform, ProvisionError, VersionConstraint, DESCRIPTOR_FILE,
};
use tempfile::TempDir;
use tracing::{debug, info};

mod lock;

pub use lock::{lock_path, remove_guard, CacheLock, LockPolicy};

const INSTALLATIONS_DIR: &str = "python";
const ENVIRONMENTS_DIR: &str = "venv";
const STAGE_PREFIX: &str = ".stage-";

/// A valid runtime installation in the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeInstallation {
    pub version: String,
    pub root: PathBuf,
    pub python: PathBuf,
}

/// Observed state of a named environment directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvironmentState {
    Absent,
    /// Directory exists but the descriptor or interpreter is missing.
    Invalid,
    Valid { runtime_version: Option<String> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvironmentEntry {
    pub name: String,
    pub root: PathBuf,
    pub runtime_version: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CacheStore {
    root: PathBuf,
    platform: &'static Platform,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, platform: &'static Platform) -> Self {
        Self {
            root: root.into(),
            platform,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn platform(&self) -> &'static Platform {
        self.platform
    }

    #[must_use]
    pub fn installations_root(&self) -> PathBuf {
        self.root.join(INSTALLATIONS_DIR)
    }

    #[must_use]
    pub fn environments_root(&self) -> PathBuf {
        self.root.join(ENVIRONMENTS_DIR)
    }

    #[must_use]
    pub fn installation_dir(&self, version: &str) -> PathBuf {
        self.installations_root().join(version)
    }

    /// Directory of a named environment.
    ///
    /// # Errors
    /// Fails with [`ProvisionError::InvalidEnvironmentName`] for names that are empty, `.`/`..`,
    /// or contain path separators.
    pub fn environment_dir(&self, name: &str) -> Result<PathBuf> {
        validate_environment_name(name)?;
        Ok(self.environments_root().join(name))
    }

    #[must_use]
    pub fn installation_is_valid(&self, version: &str) -> bool {
        let root = self.installation_dir(version);
        root.is_dir() && self.platform.runtime_python_path(&root).is_file()
    }

    #[must_use]
    pub fn installation(&self, version: &str) -> Option<RuntimeInstallation> {
        self.installation_is_valid(version)
            .then(|| self.installation_record(version))
    }

    fn installation_record(&self, version: &str) -> RuntimeInstallation {
        let root = self.installation_dir(version);
        RuntimeInstallation {
            version: version.to_string(),
            python: self.platform.runtime_python_path(&root),
            root,
        }
    }

    /// Valid installations, highest version first. Lock-free: only directories that pass the
    /// validity check are reported.
    pub fn list_installations(&self) -> Result<Vec<RuntimeInstallation>> {
        let root = self.installations_root();
        let mut found = Vec::new();
        for name in list_dir_names(&root)? {
            if name.starts_with('.') {
                continue;
            }
            let Ok(version) = semver::Version::parse(&name) else {
                continue;
            };
            if self.installation_is_valid(&name) {
                found.push((version, self.installation_record(&name)));
            }
        }
        found.sort_by(|(left, _), (right, _)| descending(left, right));
        Ok(found.into_iter().map(|(_, install)| install).collect())
    }

    /// Highest valid cached installation satisfying `constraint`.
    pub fn find_installation(
        &self,
        constraint: &VersionConstraint,
    ) -> Result<Option<RuntimeInstallation>> {
        Ok(self
            .list_installations()?
            .into_iter()
            .find(|install| constraint.matches(&install.version)))
    }

    pub fn inspect_environment(&self, name: &str) -> Result<EnvironmentState> {
        let root = self.environment_dir(name)?;
        Ok(self.environment_state(&root))
    }

    fn environment_state(&self, root: &Path) -> EnvironmentState {
        if !root.is_dir() {
            return EnvironmentState::Absent;
        }
        let descriptor = root.join(DESCRIPTOR_FILE);
        if !descriptor.is_file() || !self.platform.venv_python_path(root).is_file() {
            return EnvironmentState::Invalid;
        }
        let runtime_version = fs::read_to_string(&descriptor)
            .ok()
            .and_then(|contents| descriptor_version(&contents));
        EnvironmentState::Valid { runtime_version }
    }

    /// Valid environments sorted by name.
    pub fn list_environments(&self) -> Result<Vec<EnvironmentEntry>> {
        let mut entries = Vec::new();
        for name in list_dir_names(&self.environments_root())? {
            if validate_environment_name(&name).is_err() {
                continue;
            }
            let root = self.environments_root().join(&name);
            if let EnvironmentState::Valid { runtime_version } = self.environment_state(&root) {
                entries.push(EnvironmentEntry {
                    name,
                    root,
                    runtime_version,
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Fresh extraction directory next to the installations it will be promoted into.
    pub fn stage_dir(&self) -> Result<TempDir> {
        let root = self.installations_root();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating runtime directory at {}", root.display()))?;
        tempfile::Builder::new()
            .prefix(STAGE_PREFIX)
            .tempdir_in(&root)
            .with_context(|| format!("creating staging directory under {}", root.display()))
    }

    /// Move a fully extracted stage into `python/<version>`. The stage must already contain
    /// the runtime interpreter; otherwise it is discarded and nothing is promoted.
    pub fn promote_stage(&self, stage: TempDir, version: &str) -> Result<RuntimeInstallation> {
        let python = self.platform.runtime_python_path(stage.path());
        if !python.is_file() {
            bail!(
                "extracted runtime {version} is missing {}",
                self.platform.runtime_python
            );
        }
        let install_path = self.installation_dir(version);
        self.remove_dir(&install_path)?;
        let stage_path = stage.keep();
        if let Err(err) = fs::rename(&stage_path, &install_path) {
            let _ = fs::remove_dir_all(&stage_path);
            return Err(err).with_context(|| {
                format!("moving python runtime into place at {}", install_path.display())
            });
        }
        info!(version, path = %install_path.display(), "installed python runtime");
        Ok(self.installation_record(version))
    }

    /// Remove a cache subtree. Returns whether anything was removed; a missing path is not an
    /// error.
    pub fn remove_dir(&self, path: &Path) -> Result<bool> {
        if !path.starts_with(&self.root) || path == self.root.as_path() {
            bail!("refusing to remove {} outside the cache root", path.display());
        }
        match fs::remove_dir_all(path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed cache entry");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }

    /// Run `body` while holding the lock on `resource`. The lock is released on every exit
    /// path, including panics.
    pub fn with_lock<T>(
        &self,
        resource: &Path,
        policy: &LockPolicy,
        body: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let _lock = CacheLock::acquire(resource, policy)?;
        body()
    }
}

fn validate_environment_name(name: &str) -> Result<(), ProvisionError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.ends_with(".lock")
        || name.ends_with(".guard")
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if invalid {
        Err(ProvisionError::InvalidEnvironmentName {
            name: name.to_string(),
        })
    } else {
        Ok(())
    }
}

fn list_dir_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("reading {}", dir.display()))?;
        if !entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}
