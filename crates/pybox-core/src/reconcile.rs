//! Bringing an environment's packages in line with a requirement list.

use std::collections::HashMap;

use anyhow::Result;
use pybox_domain::{InstalledPackage, PackageRequirement, ProvisionError};
use tracing::{debug, info};

use crate::effects::ProcessRunner;
use crate::environment::VirtualEnvironment;
use crate::process::{EnvOverrides, RunOutput};

const DISABLE_VERSION_CHECK: &str = "--disable-pip-version-check";

/// What a reconciliation pass changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// The package-manager requirement, when one was given and installed up front.
    pub package_manager: Option<String>,
    /// Requirements installed in the batched invocation.
    pub installed: Vec<String>,
    /// Requirements already satisfied by the environment.
    pub satisfied: Vec<String>,
}

pub struct RequirementReconciler<'a> {
    process: &'a dyn ProcessRunner,
    envs: &'a EnvOverrides,
}

impl<'a> RequirementReconciler<'a> {
    #[must_use]
    pub fn new(process: &'a dyn ProcessRunner, envs: &'a EnvOverrides) -> Self {
        Self { process, envs }
    }

    /// Install the requirements `env` is missing. Packages not listed are left alone.
    ///
    /// # Errors
    /// [`ProvisionError::InstallFailure`] when pip exits non-zero or its listing cannot be
    /// parsed.
    pub fn reconcile(
        &self,
        env: &VirtualEnvironment,
        requirements: &[PackageRequirement],
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        if requirements.is_empty() {
            return Ok(report);
        }
        if let Some(manager) = requirements.iter().find(|req| req.is_package_manager()) {
            let arg = manager.to_install_arg();
            info!(env = %env.name, requirement = %arg, "updating package manager");
            self.install(env, std::slice::from_ref(&arg))?;
            report.package_manager = Some(arg);
        }

        let installed = self.installed_packages(env)?;
        let mut missing = Vec::new();
        for requirement in requirements.iter().filter(|req| !req.is_package_manager()) {
            let satisfied = installed
                .get(&requirement.canonical_name())
                .is_some_and(|version| requirement.is_satisfied_by(version));
            if satisfied {
                report.satisfied.push(requirement.to_string());
            } else {
                missing.push(requirement.to_install_arg());
            }
        }
        debug!(
            env = %env.name,
            missing = missing.len(),
            satisfied = report.satisfied.len(),
            "compared requirements"
        );
        if !missing.is_empty() {
            info!(env = %env.name, packages = ?missing, "installing packages");
            self.install(env, &missing)?;
            report.installed = missing;
        }
        Ok(report)
    }

    /// Installed distributions keyed by canonical name.
    pub fn installed_packages(&self, env: &VirtualEnvironment) -> Result<HashMap<String, String>> {
        let args = pip_args(&["list", "--format", "json", DISABLE_VERSION_CHECK]);
        let output = self.pip(env, &args)?;
        check("list", &output)?;
        let packages: Vec<InstalledPackage> =
            serde_json::from_str(output.stdout.trim()).map_err(|err| {
                ProvisionError::InstallFailure {
                    action: "list".to_string(),
                    status: output.code,
                    detail: format!("unreadable package listing: {err}"),
                }
            })?;
        Ok(packages
            .into_iter()
            .map(|package| {
                (
                    pybox_domain::canonicalize_package_name(&package.name),
                    package.version,
                )
            })
            .collect())
    }

    fn install(&self, env: &VirtualEnvironment, requirements: &[String]) -> Result<()> {
        let mut args = pip_args(&["install", DISABLE_VERSION_CHECK]);
        args.extend(requirements.iter().cloned());
        let output = self.pip(env, &args)?;
        check("install", &output)
    }

    fn pip(&self, env: &VirtualEnvironment, args: &[String]) -> Result<RunOutput> {
        self.process.run(&env.python, args, self.envs, None)
    }
}

fn pip_args(rest: &[&str]) -> Vec<String> {
    ["-m", "pip"]
        .iter()
        .chain(rest)
        .map(ToString::to_string)
        .collect()
}

fn check(action: &str, output: &RunOutput) -> Result<()> {
    if output.success() {
        return Ok(());
    }
    let detail = if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    };
    Err(ProvisionError::InstallFailure {
        action: action.to_string(),
        status: output.code,
        detail: detail.to_string(),
    }
    .into())
}
