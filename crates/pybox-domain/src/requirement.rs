use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use pep440_rs::{Version, VersionSpecifiers};
use serde::Deserialize;

/// Name of the package manager whose own requirement is always satisfied first.
pub const PACKAGE_MANAGER: &str = "pip";

/// A package the environment must contain, with an optional PEP 440 specifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageRequirement {
    name: String,
    specifier: Option<VersionSpecifiers>,
}

impl PackageRequirement {
    /// Build a requirement from a name and a specifier such as `>=1.0, <2`.
    /// An empty specifier or `*` accepts any installed version.
    pub fn new(name: &str, specifier: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("package requirement is missing a name"));
        }
        let specifier = specifier.trim();
        let specifier = if specifier.is_empty() || specifier == "*" {
            None
        } else {
            Some(VersionSpecifiers::from_str(specifier).map_err(|err| {
                anyhow!("invalid version specifier `{specifier}` for {name}: {err}")
            })?)
        };
        Ok(Self {
            name: name.to_string(),
            specifier,
        })
    }

    /// Parse the `name<specifier>` form, e.g. `requests>=2.31`.
    pub fn parse(spec: &str) -> Result<Self> {
        let trimmed = spec.trim();
        let end = trimmed
            .char_indices()
            .find(|(_, ch)| ch.is_ascii_whitespace() || matches!(ch, '<' | '>' | '=' | '!' | '~'))
            .map_or(trimmed.len(), |(idx, _)| idx);
        Self::new(&trimmed[..end], &trimmed[end..])
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn canonical_name(&self) -> String {
        canonicalize_package_name(&self.name)
    }

    #[must_use]
    pub fn specifier(&self) -> Option<&VersionSpecifiers> {
        self.specifier.as_ref()
    }

    #[must_use]
    pub fn is_package_manager(&self) -> bool {
        self.canonical_name() == PACKAGE_MANAGER
    }

    /// Whether an installed version satisfies this requirement.
    #[must_use]
    pub fn is_satisfied_by(&self, installed_version: &str) -> bool {
        let Some(specifier) = &self.specifier else {
            return true;
        };
        Version::from_str(installed_version.trim())
            .map(|version| specifier.contains(&version))
            .unwrap_or(false)
    }

    /// Argument form passed to the package manager.
    #[must_use]
    pub fn to_install_arg(&self) -> String {
        self.to_string()
    }
}

impl FromStr for PackageRequirement {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PackageRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.specifier {
            Some(specifier) => write!(f, "{}{}", self.name, specifier),
            None => f.write_str(&self.name),
        }
    }
}

/// One row of `pip list --format json`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

#[must_use]
pub fn canonicalize_package_name(name: &str) -> String {
    let mut canonical = String::with_capacity(name.len());
    let mut last_was_separator = false;
    for ch in name.trim().chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !last_was_separator {
                canonical.push('-');
            }
            last_was_separator = true;
        } else {
            canonical.push(ch.to_ascii_lowercase());
            last_was_separator = false;
        }
    }
    canonical
}
