//! Engine configuration.
//!
//! The engine only ever reads the explicit [`EngineConfig`] it is given. [`EngineConfig::from_env`]
//! is a convenience for callers that want the conventional environment variables.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use dirs_next::{cache_dir, home_dir};
use pybox_store::LockPolicy;

use crate::process::EnvOverrides;

pub const DEFAULT_RELEASES_URL: &str =
    "https://api.github.com/repos/indygreg/python-build-standalone/releases";
const CACHE_DIR_ENV: &str = "PYBOX_CACHE_DIR";
const RELEASES_URL_ENV: &str = "PYBOX_RELEASES_URL";
const KEEP_PROXIES_ENV: &str = "PYBOX_KEEP_PROXIES";
const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";
const PROXY_KEYS: &[&str] = &[
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "ALL_PROXY",
    "all_proxy",
    "NO_PROXY",
    "no_proxy",
];

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub cache_root: PathBuf,
    pub releases_url: String,
    pub github_token: Option<String>,
    pub lock: LockPolicy,
    /// Applied to every subprocess the engine and its runners spawn.
    pub subprocess_env: EnvOverrides,
    pub http_timeout: Duration,
    pub keep_proxies: bool,
    /// Reuse the highest cached runtime satisfying a constraint instead of asking the registry.
    pub prefer_cached_runtimes: bool,
}

impl EngineConfig {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            releases_url: DEFAULT_RELEASES_URL.to_string(),
            github_token: None,
            lock: LockPolicy::default(),
            subprocess_env: EnvOverrides::default(),
            http_timeout: Duration::from_secs(60),
            keep_proxies: false,
            prefer_cached_runtimes: true,
        }
    }

    /// Builds a configuration from the current process environment.
    ///
    /// # Errors
    /// Returns an error if no cache directory can be determined.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let cache_root = match snapshot.var(CACHE_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            Some(path) => PathBuf::from(path),
            None => default_cache_root()?,
        };
        let mut config = Self::new(cache_root);
        if let Some(url) = snapshot.var(RELEASES_URL_ENV).filter(|v| !v.trim().is_empty()) {
            config.releases_url = url.trim().to_string();
        }
        config.github_token = snapshot
            .var(GITHUB_TOKEN_ENV)
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        config.keep_proxies = keep_proxies(snapshot);
        Ok(config)
    }
}

fn default_cache_root() -> Result<PathBuf> {
    cache_dir()
        .or_else(|| home_dir().map(|home| home.join(".cache")))
        .map(|base| base.join("pybox"))
        .ok_or_else(|| anyhow!("unable to determine a cache directory; set {CACHE_DIR_ENV}"))
}

/// Proxies are honored when `PYBOX_KEEP_PROXIES` is truthy, or when it is unset and a
/// standard proxy variable is present.
fn keep_proxies(snapshot: &EnvSnapshot) -> bool {
    match snapshot.var(KEEP_PROXIES_ENV) {
        Some(raw) => {
            let value = raw.trim().to_ascii_lowercase();
            !matches!(value.as_str(), "" | "0" | "false" | "no" | "off")
        }
        None => PROXY_KEYS.iter().any(|key| {
            snapshot
                .var(key)
                .is_some_and(|value| !value.trim().is_empty())
        }),
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}
