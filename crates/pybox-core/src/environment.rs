//! Named virtual environments bound to one runtime.

use std::path::PathBuf;

use anyhow::Result;
use pybox_domain::{PackageRequirement, ProvisionError, VersionConstraint};
use pybox_store::{remove_guard, CacheStore, EnvironmentState, RuntimeInstallation};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::effects::Effects;
use crate::reconcile::{ReconcileReport, RequirementReconciler};
use crate::runner::activation_env;
use crate::runtime::RuntimeMaterializer;

/// Request for [`EnvironmentManager::get_or_create`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvOptions {
    pub name: String,
    /// Runtime constraint; `None` accepts the latest release.
    pub runtime_version: Option<String>,
    pub requirements: Vec<PackageRequirement>,
    pub check_requirements: bool,
    /// Rebuild an environment whose runtime no longer satisfies the constraint instead of
    /// failing with [`ProvisionError::VersionConflict`].
    pub allow_runtime_upgrade: bool,
}

impl EnvOptions {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runtime_version: None,
            requirements: Vec::new(),
            check_requirements: true,
            allow_runtime_upgrade: true,
        }
    }

    #[must_use]
    pub fn runtime_version(mut self, constraint: impl Into<String>) -> Self {
        self.runtime_version = Some(constraint.into());
        self
    }

    #[must_use]
    pub fn requirement(mut self, requirement: PackageRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    #[must_use]
    pub fn requirements(mut self, requirements: impl IntoIterator<Item = PackageRequirement>) -> Self {
        self.requirements.extend(requirements);
        self
    }

    #[must_use]
    pub fn check_requirements(mut self, check: bool) -> Self {
        self.check_requirements = check;
        self
    }

    #[must_use]
    pub fn allow_runtime_upgrade(mut self, allow: bool) -> Self {
        self.allow_runtime_upgrade = allow;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualEnvironment {
    pub name: String,
    pub root: PathBuf,
    pub bin_dir: PathBuf,
    pub python: PathBuf,
    /// Runtime version recorded in the environment descriptor.
    pub runtime_version: Option<String>,
}

/// Outcome of [`EnvironmentManager::get_or_create`].
#[derive(Clone, Debug)]
pub struct Provisioned {
    pub env: VirtualEnvironment,
    pub created: bool,
    pub reconcile: Option<ReconcileReport>,
}

pub struct EnvironmentManager<'a> {
    store: &'a CacheStore,
    effects: &'a dyn Effects,
    config: &'a EngineConfig,
}

impl<'a> EnvironmentManager<'a> {
    #[must_use]
    pub fn new(store: &'a CacheStore, effects: &'a dyn Effects, config: &'a EngineConfig) -> Self {
        Self {
            store,
            effects,
            config,
        }
    }

    /// Reuse, repair, or build the environment named in `options`, then reconcile its
    /// packages. The whole sequence runs under the environment's lock.
    ///
    /// # Errors
    /// Propagates resolution, download, lock, and subprocess failures;
    /// [`ProvisionError::VersionConflict`] when the bound runtime no longer satisfies the
    /// constraint and upgrades are disallowed.
    pub fn get_or_create(&self, options: &EnvOptions) -> Result<Provisioned> {
        let constraint = VersionConstraint::from_option(options.runtime_version.as_deref())?;
        let root = self.store.environment_dir(&options.name)?;
        self.store.with_lock(&root, &self.config.lock, || {
            let (env, created) = match self.store.inspect_environment(&options.name)? {
                EnvironmentState::Valid { runtime_version }
                    if constraint.is_latest()
                        || runtime_version
                            .as_deref()
                            .is_some_and(|version| constraint.matches(version)) =>
                {
                    debug!(env = %options.name, "reusing environment");
                    (self.describe(&options.name, runtime_version)?, false)
                }
                EnvironmentState::Valid { runtime_version } => {
                    let found = runtime_version.unwrap_or_else(|| "unknown".to_string());
                    if !options.allow_runtime_upgrade {
                        return Err(ProvisionError::VersionConflict {
                            name: options.name.clone(),
                            found,
                            constraint: constraint.to_string(),
                        }
                        .into());
                    }
                    info!(env = %options.name, %found, %constraint, "rebuilding environment for new runtime");
                    self.store.remove_dir(&root)?;
                    (self.build(&options.name, &constraint)?, true)
                }
                EnvironmentState::Invalid => {
                    warn!(env = %options.name, "removing incomplete environment");
                    self.store.remove_dir(&root)?;
                    (self.build(&options.name, &constraint)?, true)
                }
                EnvironmentState::Absent => (self.build(&options.name, &constraint)?, true),
            };
            let reconcile = if options.check_requirements {
                let envs = activation_env(&env, &self.config.subprocess_env)?;
                Some(
                    RequirementReconciler::new(self.effects.process(), &envs)
                        .reconcile(&env, &options.requirements)?,
                )
            } else {
                None
            };
            Ok(Provisioned {
                env,
                created,
                reconcile,
            })
        })
    }

    /// Delete an environment and its lock guard. Returns whether the environment existed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let root = self.store.environment_dir(name)?;
        self.store.with_lock(&root, &self.config.lock, || {
            let removed = self.store.remove_dir(&root)?;
            remove_guard(&root)?;
            if removed {
                info!(env = name, "removed environment");
            }
            Ok(removed)
        })
    }

    /// Inspect an environment without creating or repairing it.
    pub fn find(&self, name: &str) -> Result<Option<VirtualEnvironment>> {
        match self.store.inspect_environment(name)? {
            EnvironmentState::Valid { runtime_version } => {
                Ok(Some(self.describe(name, runtime_version)?))
            }
            EnvironmentState::Absent | EnvironmentState::Invalid => Ok(None),
        }
    }

    /// Valid environments, sorted by name.
    pub fn list(&self) -> Result<Vec<VirtualEnvironment>> {
        self.store
            .list_environments()?
            .into_iter()
            .map(|entry| self.describe(&entry.name, entry.runtime_version))
            .collect()
    }

    fn describe(&self, name: &str, runtime_version: Option<String>) -> Result<VirtualEnvironment> {
        let root = self.store.environment_dir(name)?;
        let platform = self.store.platform();
        Ok(VirtualEnvironment {
            name: name.to_string(),
            bin_dir: platform.venv_bin_path(&root),
            python: platform.venv_python_path(&root),
            root,
            runtime_version,
        })
    }

    fn build(&self, name: &str, constraint: &VersionConstraint) -> Result<VirtualEnvironment> {
        let runtime = RuntimeMaterializer::new(self.store, self.effects, self.config)
            .ensure(constraint)?;
        self.create(name, &runtime)?;
        let env = self.describe(name, Some(runtime.version.clone()))?;
        if !env.python.is_file() {
            return Err(ProvisionError::EnvironmentCreation {
                name: name.to_string(),
                status: 0,
                stderr: format!("{} was not created", env.python.display()),
            }
            .into());
        }
        Ok(env)
    }

    fn create(&self, name: &str, runtime: &RuntimeInstallation) -> Result<()> {
        let root = self.store.environment_dir(name)?;
        info!(env = name, runtime = %runtime.version, "creating environment");
        let args = vec![
            "-m".to_string(),
            "venv".to_string(),
            root.display().to_string(),
        ];
        let mut envs = self.config.subprocess_env.clone();
        envs.remove("PYTHONHOME");
        let output = self
            .effects
            .process()
            .run(&runtime.python, &args, &envs, None)?;
        if !output.success() {
            return Err(ProvisionError::EnvironmentCreation {
                name: name.to_string(),
                status: output.code,
                stderr: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(())
    }
}
