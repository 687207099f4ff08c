//! Download, verify, and unpack runtime archives.

use anyhow::{Context, Result};
use pybox_domain::{ProvisionError, ResolvedRelease};
use pybox_store::{CacheStore, RuntimeInstallation};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::archive;
use crate::effects::Downloader;

pub struct ArtifactFetcher<'a> {
    downloader: &'a dyn Downloader,
}

impl<'a> ArtifactFetcher<'a> {
    #[must_use]
    pub fn new(downloader: &'a dyn Downloader) -> Self {
        Self { downloader }
    }

    /// Download the archive and its checksum and return the archive bytes once they verify.
    pub fn fetch_verified(&self, release: &ResolvedRelease) -> Result<Vec<u8>> {
        info!(asset = %release.asset_name, "downloading python runtime");
        let bytes = self.downloader.download(&release.download_url)?;
        let checksum = self
            .downloader
            .download_text(&release.checksum_url)
            .with_context(|| format!("fetching checksum for {}", release.asset_name))?;
        verify_checksum(&release.asset_name, &bytes, &checksum)?;
        debug!(asset = %release.asset_name, size = bytes.len(), "checksum verified");
        Ok(bytes)
    }

    /// Fetch `release` and install it as `python/<version>` in `store`.
    ///
    /// Nothing under the cache root changes unless the checksum matches; extraction happens in
    /// a staging directory that is renamed into place only after it completes.
    pub fn fetch_and_extract(
        &self,
        release: &ResolvedRelease,
        store: &CacheStore,
    ) -> Result<RuntimeInstallation> {
        let bytes = self.fetch_verified(release)?;
        let stage = store.stage_dir()?;
        debug!(stage = %stage.path().display(), "extracting python runtime");
        archive::unpack(&bytes, release.format, stage.path())
            .with_context(|| format!("extracting {}", release.asset_name))?;
        store.promote_stage(stage, &release.version)
    }
}

/// Compare the SHA-256 of `bytes` against the first token of a `.sha256` companion file.
pub fn verify_checksum(asset: &str, bytes: &[u8], checksum_text: &str) -> Result<()> {
    let expected = checksum_text
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let actual = hex::encode(Sha256::digest(bytes));
    if expected != actual {
        return Err(ProvisionError::ChecksumMismatch {
            asset: asset.to_string(),
            expected,
            actual,
        }
        .into());
    }
    Ok(())
}
