//! Release catalog entities and python-build-standalone asset naming.

use serde::Deserialize;

const ASSET_PREFIX: &str = "cpython-";
const INSTALL_ONLY: &str = "-install_only.tar.";
pub const CHECKSUM_SUFFIX: &str = ".sha256";

/// One release as listed by the registry.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Release {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub assets: Vec<RemoteAsset>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RemoteAsset {
    pub name: String,
    #[serde(rename = "browser_download_url")]
    pub url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarZst,
}

impl ArchiveFormat {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        if name.ends_with(".tar.gz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar.zst") {
            Some(Self::TarZst)
        } else {
            None
        }
    }
}

/// A release asset annotated with the runtime version embedded in its name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub name: String,
    pub url: String,
    pub version: Option<semver::Version>,
    pub checksum_url: Option<String>,
}

impl ReleaseAsset {
    /// Annotate every asset of a release for `triple`, pairing each with its checksum companion.
    #[must_use]
    pub fn annotate(release: &Release, triple: &str) -> Vec<ReleaseAsset> {
        release
            .assets
            .iter()
            .map(|asset| {
                let checksum_name = format!("{}{CHECKSUM_SUFFIX}", asset.name);
                ReleaseAsset {
                    name: asset.name.clone(),
                    url: asset.url.clone(),
                    version: install_only_version(&asset.name, triple),
                    checksum_url: release
                        .assets
                        .iter()
                        .find(|candidate| candidate.name == checksum_name)
                        .map(|candidate| candidate.url.clone()),
                }
            })
            .collect()
    }
}

/// The build chosen for a constraint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRelease {
    pub version: String,
    pub asset_name: String,
    pub download_url: String,
    pub checksum_url: String,
    pub format: ArchiveFormat,
}

/// Extract the version from an `install_only` asset name for `triple`:
/// `cpython-<X.Y.Z>+<build>-<triple>-install_only.tar.<gz|zst>`.
#[must_use]
pub fn install_only_version(name: &str, triple: &str) -> Option<semver::Version> {
    let rest = name.strip_prefix(ASSET_PREFIX)?;
    let (version, rest) = rest.split_once('+')?;
    let (build, rest) = rest.split_once('-')?;
    if build.is_empty() || !build.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let extension = rest.strip_prefix(triple)?.strip_prefix(INSTALL_ONLY)?;
    if !matches!(extension, "gz" | "zst") {
        return None;
    }
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3
        || parts
            .iter()
            .any(|part| part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }
    semver::Version::parse(version).ok()
}
