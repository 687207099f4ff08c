use std::time::Duration;

use anyhow::{Context, Result};
use pybox_domain::Release;
use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use tracing::debug;
use url::Url;

use crate::effects::{Downloader, ReleaseRegistry};

const USER_AGENT: &str = concat!("pybox/", env!("CARGO_PKG_VERSION"));
const GITHUB_JSON: &str = "application/vnd.github+json";

pub(crate) fn build_http_client(timeout: Duration, keep_proxies: bool) -> Result<Client> {
    let builder = Client::builder().user_agent(USER_AGENT).timeout(timeout);
    let builder = if keep_proxies {
        builder
    } else {
        builder.no_proxy()
    };
    builder.build().context("failed to build HTTP client")
}

/// GitHub releases listing for the python-build-standalone project.
pub struct GithubReleases {
    client: Client,
    url: String,
    token: Option<String>,
}

impl GithubReleases {
    #[must_use]
    pub fn new(client: Client, url: String, token: Option<String>) -> Self {
        Self { client, url, token }
    }

    fn page_url(&self, page: u32, per_page: u32) -> Result<Url> {
        let mut url = Url::parse(&self.url)
            .with_context(|| format!("invalid release registry url `{}`", self.url))?;
        url.query_pairs_mut()
            .append_pair("per_page", &per_page.to_string())
            .append_pair("page", &page.to_string());
        Ok(url)
    }
}

impl ReleaseRegistry for GithubReleases {
    fn releases_page(&self, page: u32, per_page: u32) -> Result<Vec<Release>> {
        let url = self.page_url(page, per_page)?;
        debug!(%url, "fetching release page");
        let mut request = self.client.get(url.as_str()).header(ACCEPT, GITHUB_JSON);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .with_context(|| format!("failed to list releases from {url}"))?
            .error_for_status()
            .with_context(|| format!("release listing request failed ({url})"))?;
        response
            .json::<Vec<Release>>()
            .with_context(|| format!("invalid release listing from {url}"))
    }
}

pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url, "downloading");
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to download {url}"))?
            .error_for_status()
            .with_context(|| format!("download failed for {url}"))?;
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read response body from {url}"))?;
        Ok(bytes.to_vec())
    }
}
