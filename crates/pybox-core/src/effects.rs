//! Collaborator seams: release catalog, artifact downloads, and subprocesses.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use pybox_domain::Release;

use crate::config::EngineConfig;
use crate::http::{build_http_client, GithubReleases, HttpDownloader};
use crate::process::{run_command, EnvOverrides, RunOutput};

/// Paginated, newest-first listing of runtime releases.
pub trait ReleaseRegistry: Send + Sync {
    /// Fetch one page (1-based). An empty page marks the end of the listing.
    fn releases_page(&self, page: u32, per_page: u32) -> Result<Vec<Release>>;
}

pub trait Downloader: Send + Sync {
    fn download(&self, url: &str) -> Result<Vec<u8>>;

    fn download_text(&self, url: &str) -> Result<String> {
        let bytes = self.download(url)?;
        String::from_utf8(bytes).with_context(|| format!("{url} is not valid UTF-8"))
    }
}

pub trait ProcessRunner: Send + Sync {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        envs: &EnvOverrides,
        cwd: Option<&Path>,
    ) -> Result<RunOutput>;
}

pub trait Effects: Send + Sync {
    fn registry(&self) -> &dyn ReleaseRegistry;
    fn downloader(&self) -> &dyn Downloader;
    fn process(&self) -> &dyn ProcessRunner;
}

pub struct SystemEffects {
    registry: Arc<GithubReleases>,
    downloader: Arc<HttpDownloader>,
    process: Arc<SystemProcessRunner>,
}

impl SystemEffects {
    /// Build HTTP-backed collaborators from `config`.
    ///
    /// # Errors
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = build_http_client(config.http_timeout, config.keep_proxies)?;
        Ok(Self {
            registry: Arc::new(GithubReleases::new(
                client.clone(),
                config.releases_url.clone(),
                config.github_token.clone(),
            )),
            downloader: Arc::new(HttpDownloader::new(client)),
            process: Arc::new(SystemProcessRunner),
        })
    }
}

impl Effects for SystemEffects {
    fn registry(&self) -> &dyn ReleaseRegistry {
        self.registry.as_ref()
    }

    fn downloader(&self) -> &dyn Downloader {
        self.downloader.as_ref()
    }

    fn process(&self) -> &dyn ProcessRunner {
        self.process.as_ref()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        envs: &EnvOverrides,
        cwd: Option<&Path>,
    ) -> Result<RunOutput> {
        run_command(program, args, envs, cwd)
    }
}
