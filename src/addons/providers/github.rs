//! GitHub-releases provider adapter.
//!
//! Treats a GitHub repository (`owner/repo`) as one addon: the latest
//! release is the latest version, a `.zip` release asset (or the source
//! zipball as fallback) is the downloadable file, and the release body is
//! the changelog.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::addons::AddonError;
use crate::addons::provider::{AddonProvider, AddonSearchResult, AddonSearchResultFile};
use crate::addons::types::{Addon, ChannelType, Installation};
use crate::net::{NetError, ResilientHttpClient};

use async_trait::async_trait;

/// Provider name, also the breaker key.
pub const PROVIDER_NAME: &str = "github";

/// GitHub API base URL.
const API_BASE: &str = "https://api.github.com";

/// Accept header for the v3 REST API.
const ACCEPT_HEADER: (&str, &str) = ("Accept", "application/vnd.github.v3+json");

/// GitHub release payload.
#[derive(Debug, Clone, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
    #[serde(default)]
    zipball_url: Option<String>,
}

/// GitHub release asset.
#[derive(Debug, Clone, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    download_count: u64,
}

/// GitHub repository payload (search results).
#[derive(Debug, Clone, Deserialize)]
struct GitHubRepo {
    full_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    owner: Option<GitHubOwner>,
}

#[derive(Debug, Clone, Deserialize)]
struct GitHubOwner {
    login: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GitHubSearchResponse {
    #[serde(default)]
    items: Vec<GitHubRepo>,
}

/// Parses a GitHub timestamp (RFC 3339) into Unix seconds.
fn parse_timestamp(value: &str) -> Option<u64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp().max(0) as u64)
}

/// Maps a release into the normalized result model.
fn release_to_result(repo: &str, release: &GitHubRelease) -> AddonSearchResult {
    let version = release.tag_name.trim_start_matches('v').to_string();
    let released_at = release.published_at.as_deref().and_then(parse_timestamp);
    let channel_type = if release.prerelease {
        ChannelType::Beta
    } else {
        ChannelType::Stable
    };

    // Prefer a packaged .zip asset; fall back to the source zipball.
    let asset = release
        .assets
        .iter()
        .find(|a| a.name.to_lowercase().ends_with(".zip"));
    let download_url = asset
        .map(|a| a.browser_download_url.clone())
        .or_else(|| release.zipball_url.clone());
    let download_count = asset.map(|a| a.download_count);

    let (author, name) = match repo.split_once('/') {
        Some((owner, name)) => (owner.to_string(), name.to_string()),
        None => (String::new(), repo.to_string()),
    };

    let files = download_url
        .map(|url| {
            vec![AddonSearchResultFile {
                version: version.clone(),
                download_url: url,
                release_date: released_at,
                channel_type,
                game_versions: Vec::new(),
                dependencies: Vec::new(),
            }]
        })
        .unwrap_or_default();

    AddonSearchResult {
        provider_name: PROVIDER_NAME.to_string(),
        external_id: repo.to_string(),
        name,
        author,
        external_url: format!("https://github.com/{repo}"),
        summary: None,
        thumbnail_url: None,
        download_count,
        released_at,
        changelog: release.body.clone(),
        files,
    }
}

/// GitHub-backed addon provider.
pub struct GithubAddonProvider {
    client: Arc<ResilientHttpClient>,
}

impl GithubAddonProvider {
    /// Creates a provider over a registry-issued client.
    #[must_use]
    pub fn new(client: Arc<ResilientHttpClient>) -> Self {
        Self { client }
    }

    /// Fetches the latest release for a repository.
    ///
    /// A 404 means the repository has no releases (or does not exist) and is
    /// reported as `None`, not as an error.
    async fn fetch_latest_release(&self, repo: &str) -> Result<Option<GitHubRelease>, AddonError> {
        let url = format!("{API_BASE}/repos/{repo}/releases/latest");
        match self
            .client
            .get_json::<GitHubRelease>(&url, &[ACCEPT_HEADER], None)
            .await
        {
            Ok(release) => Ok(Some(release)),
            Err(NetError::Status { code: 404 }) => {
                debug!("[GITHUB] No release data for '{}'", repo);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl AddonProvider for GithubAddonProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn get_latest(
        &self,
        _installation: &Installation,
        addon: &Addon,
    ) -> Result<Option<AddonSearchResult>, AddonError> {
        let repo = addon.external_id.as_str();
        if repo.is_empty() || !repo.contains('/') {
            return Ok(None);
        }

        let release = self.fetch_latest_release(repo).await?;
        Ok(release.map(|r| release_to_result(repo, &r)))
    }

    async fn search(
        &self,
        _installation: &Installation,
        term: &str,
    ) -> Result<Vec<AddonSearchResult>, AddonError> {
        let query = term.trim().replace(' ', "+");
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{API_BASE}/search/repositories?q={query}&per_page=20");
        let response = self
            .client
            .get_json::<GitHubSearchResponse>(&url, &[ACCEPT_HEADER], None)
            .await?;

        // Search returns repository metadata only; release/file details are
        // resolved when the user installs a result.
        let results = response
            .items
            .into_iter()
            .map(|repo| AddonSearchResult {
                provider_name: PROVIDER_NAME.to_string(),
                external_id: repo.full_name.clone(),
                name: repo
                    .full_name
                    .split_once('/')
                    .map(|(_, name)| name.to_string())
                    .unwrap_or_else(|| repo.full_name.clone()),
                author: repo.owner.map(|o| o.login).unwrap_or_default(),
                external_url: repo.html_url,
                summary: repo.description,
                ..AddonSearchResult::default()
            })
            .collect();
        Ok(results)
    }

    async fn get_changelog(
        &self,
        _installation: &Installation,
        addon: &Addon,
    ) -> Result<Option<String>, AddonError> {
        let repo = addon.external_id.as_str();
        if repo.is_empty() || !repo.contains('/') {
            return Ok(None);
        }

        let release = self.fetch_latest_release(repo).await?;
        Ok(release.and_then(|r| r.body))
    }
}
