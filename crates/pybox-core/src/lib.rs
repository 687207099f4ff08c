//! Provisioning of standalone Python runtimes and named virtual environments.
//!
//! [`Provisioner`] is the entry point: it resolves a runtime constraint against the
//! python-build-standalone releases, installs the verified archive into the cache, builds a
//! virtual environment on top of it, installs missing packages, and hands back an
//! [`EnvRunner`] for running commands inside the environment.

#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod archive;
pub mod config;
pub mod effects;
mod engine;
pub mod environment;
pub mod fetcher;
mod http;
pub mod process;
pub mod reconcile;
pub mod resolver;
mod runner;
mod runtime;

pub use config::{EngineConfig, DEFAULT_RELEASES_URL};
pub use effects::{Downloader, Effects, ProcessRunner, ReleaseRegistry, SystemEffects};
pub use engine::Provisioner;
pub use environment::{EnvOptions, EnvironmentManager, Provisioned, VirtualEnvironment};
pub use fetcher::{verify_checksum, ArtifactFetcher};
pub use http::{GithubReleases, HttpDownloader};
pub use process::{run_command, EnvOverrides, RunOutput};
pub use reconcile::{ReconcileReport, RequirementReconciler};
pub use resolver::VersionResolver;
pub use runner::EnvRunner;

pub use pybox_domain::{
    ArchiveFormat, PackageRequirement, Platform, ProvisionError, Release, RemoteAsset,
    ResolvedRelease, VersionConstraint,
};
pub use pybox_store::{CacheStore, LockPolicy, RuntimeInstallation};
