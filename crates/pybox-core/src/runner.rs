//! Running commands inside a provisioned environment.

use std::env;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use pybox_domain::Platform;

use crate::effects::Effects;
use crate::environment::VirtualEnvironment;
use crate::process::{EnvOverrides, RunOutput};

const PATH_VAR: &str = "PATH";
const VIRTUAL_ENV_VAR: &str = "VIRTUAL_ENV";
const PYTHONHOME_VAR: &str = "PYTHONHOME";

/// Handle returned by provisioning; every command it spawns sees the environment's
/// interpreter first on `PATH`.
pub struct EnvRunner {
    env: VirtualEnvironment,
    platform: &'static Platform,
    effects: Arc<dyn Effects>,
    envs: EnvOverrides,
}

impl fmt::Debug for EnvRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvRunner")
            .field("env", &self.env)
            .field("platform", &self.platform.triple)
            .field("envs", &self.envs)
            .finish_non_exhaustive()
    }
}

impl EnvRunner {
    pub(crate) fn new(
        env: VirtualEnvironment,
        platform: &'static Platform,
        effects: Arc<dyn Effects>,
        base: &EnvOverrides,
    ) -> Result<Self> {
        let envs = activation_env(&env, base)?;
        Ok(Self {
            env,
            platform,
            effects,
            envs,
        })
    }

    #[must_use]
    pub fn environment(&self) -> &VirtualEnvironment {
        &self.env
    }

    /// Variables applied to every command before per-call overrides.
    #[must_use]
    pub fn env_vars(&self) -> &EnvOverrides {
        &self.envs
    }

    pub fn run(&self, program: &str, args: &[String]) -> Result<RunOutput> {
        self.run_with(program, args, &EnvOverrides::new(), None)
    }

    /// Run `program` with `overrides` layered last, so they win over the environment defaults.
    pub fn run_with(
        &self,
        program: &str,
        args: &[String],
        overrides: &EnvOverrides,
        cwd: Option<&Path>,
    ) -> Result<RunOutput> {
        let program = self.resolve_program(program);
        let mut envs = self.envs.clone();
        envs.extend(overrides);
        self.effects.process().run(&program, args, &envs, cwd)
    }

    pub fn python(&self, args: &[String]) -> Result<RunOutput> {
        self.effects
            .process()
            .run(&self.env.python, args, &self.envs, None)
    }

    /// Bare names that exist in the environment's bin directory resolve there; anything else
    /// is left for the OS to look up.
    #[must_use]
    pub fn resolve_program(&self, program: &str) -> PathBuf {
        if !program.contains(['/', '\\']) {
            let candidate = self.env.bin_dir.join(self.platform.executable_name(program));
            if candidate.is_file() {
                return candidate;
            }
        }
        PathBuf::from(program)
    }
}

/// Variables that activate `env`: bin directory first on `PATH`, `VIRTUAL_ENV` set, and
/// `PYTHONHOME` cleared, layered over `base`.
pub(crate) fn activation_env(env: &VirtualEnvironment, base: &EnvOverrides) -> Result<EnvOverrides> {
    let inherited: Option<OsString> = if base.is_removed(PATH_VAR) {
        None
    } else {
        base.get(PATH_VAR)
            .map(OsString::from)
            .or_else(|| env::var_os(PATH_VAR))
    };
    let mut entries = vec![env.bin_dir.clone()];
    if let Some(inherited) = inherited {
        entries.extend(env::split_paths(&inherited).filter(|entry| entry != &env.bin_dir));
    }
    let path = env::join_paths(entries).context("building PATH for environment")?;

    let mut envs = base.clone();
    envs.insert(PATH_VAR, path.to_string_lossy());
    envs.insert(VIRTUAL_ENV_VAR, env.root.display().to_string());
    envs.remove(PYTHONHOME_VAR);
    Ok(envs)
}
