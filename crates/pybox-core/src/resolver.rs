//! Mapping a version constraint onto a concrete release asset.

use std::cmp::Ordering;

use anyhow::{anyhow, Result};
use pybox_domain::{
    descending, ArchiveFormat, Platform, ProvisionError, Release, ReleaseAsset, ResolvedRelease,
    VersionConstraint,
};
use tracing::{debug, info};

use crate::effects::ReleaseRegistry;

const LATEST_PAGE_SIZE: u32 = 1;
const CONSTRAINED_PAGE_SIZE: u32 = 10;

pub struct VersionResolver<'a> {
    registry: &'a dyn ReleaseRegistry,
    platform: &'static Platform,
}

impl<'a> VersionResolver<'a> {
    #[must_use]
    pub fn new(registry: &'a dyn ReleaseRegistry, platform: &'static Platform) -> Self {
        Self { registry, platform }
    }

    /// Walk releases newest-first and stop at the first one publishing a satisfying build.
    ///
    /// # Errors
    /// [`ProvisionError::NoMatchingRelease`] when the listing is exhausted,
    /// [`ProvisionError::NoChecksum`] when the chosen asset has no companion checksum, and any
    /// registry failure.
    pub fn resolve(&self, constraint: &VersionConstraint) -> Result<ResolvedRelease> {
        let per_page = if constraint.is_latest() {
            LATEST_PAGE_SIZE
        } else {
            CONSTRAINED_PAGE_SIZE
        };
        let mut page = 1;
        loop {
            let releases = self.registry.releases_page(page, per_page)?;
            debug!(page, count = releases.len(), %constraint, "scanning releases");
            for release in releases.iter().filter(|release| !release.draft) {
                if let Some(asset) = self.select_asset(release, constraint) {
                    return finish(release, asset);
                }
            }
            if releases.len() < per_page as usize {
                break;
            }
            page += 1;
        }
        Err(ProvisionError::NoMatchingRelease {
            constraint: constraint.to_string(),
        }
        .into())
    }

    /// The highest-versioned asset of `release` built for this platform that satisfies
    /// `constraint`.
    #[must_use]
    pub fn select_asset(
        &self,
        release: &Release,
        constraint: &VersionConstraint,
    ) -> Option<ReleaseAsset> {
        let mut assets = ReleaseAsset::annotate(release, self.platform.triple);
        assets.sort_by(|left, right| match (&left.version, &right.version) {
            (Some(left), Some(right)) => descending(left, right),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        assets.into_iter().find(|asset| {
            asset
                .version
                .as_ref()
                .is_some_and(|version| constraint.matches_version(version))
        })
    }
}

fn finish(release: &Release, asset: ReleaseAsset) -> Result<ResolvedRelease> {
    let Some(checksum_url) = asset.checksum_url else {
        return Err(ProvisionError::NoChecksum { asset: asset.name }.into());
    };
    let format = ArchiveFormat::from_name(&asset.name)
        .ok_or_else(|| anyhow!("unsupported archive format for {}", asset.name))?;
    let version = asset
        .version
        .map(|version| version.to_string())
        .unwrap_or_default();
    info!(
        release = %release.tag_name,
        asset = %asset.name,
        version = %version,
        "resolved python release"
    );
    Ok(ResolvedRelease {
        version,
        asset_name: asset.name,
        download_url: asset.url,
        checksum_url,
        format,
    })
}
