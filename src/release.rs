use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::ReleaseConfig;
use crate::error::{Result, WrapperError};

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = "limbo-wrapper";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const API_READ_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Somewhere a release archive can be fetched from.
pub trait ArchiveSource: Send + Sync {
    /// Write the archive called `archive_name` to `target`.
    fn fetch(&self, archive_name: &str, target: &Path) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    #[serde(default)]
    tag_name: Option<String>,
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
}

pub struct ReleaseFetcher {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    download_url: Option<String>,
}

impl ReleaseFetcher {
    pub fn new(config: &ReleaseConfig) -> Result<Self> {
        let (owner, repo) = config.parse_repository()?;

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(DOWNLOAD_READ_TIMEOUT)
            .build()
            .map_err(|e| WrapperError::Download {
                url: GITHUB_API.to_string(),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_base: GITHUB_API.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            download_url: config.custom_download_url().map(str::to_string),
        })
    }

    /// Point release lookups at a different API host.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn repository(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Resolve the download URL for `archive_name`.
    pub async fn resolve(&self, archive_name: &str) -> Result<String> {
        if let Some(url) = &self.download_url {
            info!("Using custom download URL");
            return Ok(url.clone());
        }

        let release = self.fetch_latest_release().await?;
        if let Some(tag) = &release.tag_name {
            debug!("Latest release of {} is {}", self.repository(), tag);
        }

        select_asset(&release, archive_name)
            .map(|asset| asset.browser_download_url.clone())
            .ok_or_else(|| WrapperError::AssetNotFound {
                archive: archive_name.to_string(),
                repository: self.repository(),
            })
    }

    async fn fetch_latest_release(&self) -> Result<GitHubRelease> {
        let url = format!(
            "{}/repos/{}/{}/releases/latest",
            self.api_base, self.owner, self.repo
        );
        let download_error = |reason: String| WrapperError::Download {
            url: url.clone(),
            reason,
        };

        let response = self
            .client
            .get(&url)
            .timeout(API_READ_TIMEOUT)
            .send()
            .await
            .map_err(|e| download_error(format!("Failed to fetch release info: {}", e)))?;

        if !response.status().is_success() {
            return Err(download_error(format!(
                "GitHub API returned status: {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| download_error(format!("Failed to parse release JSON: {}", e)))
    }

    /// Stream `url` into `target`, logging progress every 10%.
    pub async fn download(&self, url: &str, target: &Path) -> Result<u64> {
        info!("Downloading from {}...", url);
        let download_error = |reason: String| WrapperError::Download {
            url: url.to_string(),
            reason,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| download_error(format!("Failed to download asset: {}", e)))?;

        if !response.status().is_success() {
            return Err(download_error(format!(
                "Server returned status: {}",
                response.status()
            )));
        }

        let mut progress = DownloadProgress::new(response.content_length());
        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| download_error(format!("Failed to create {}: {}", target.display(), e)))?;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| download_error(format!("Failed to read response body: {}", e)))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| download_error(format!("Failed to write {}: {}", target.display(), e)))?;

            if let Some(percent) = progress.advance(chunk.len() as u64) {
                info!("Download progress: {}%", percent);
            }
        }

        file.flush()
            .await
            .map_err(|e| download_error(format!("Failed to write {}: {}", target.display(), e)))?;

        info!("Download complete");
        Ok(progress.received)
    }
}

impl ArchiveSource for ReleaseFetcher {
    async fn fetch(&self, archive_name: &str, target: &Path) -> Result<()> {
        let url = self.resolve(archive_name).await?;
        info!("Downloading {}...", archive_name);
        self.download(&url, target).await?;
        Ok(())
    }
}

fn select_asset<'a>(release: &'a GitHubRelease, archive_name: &str) -> Option<&'a GitHubAsset> {
    release
        .assets
        .iter()
        .find(|asset| asset.name == archive_name)
}

/// Tracks received bytes and reports whole-percent progress in 10-point steps.
#[derive(Debug)]
struct DownloadProgress {
    total: Option<u64>,
    received: u64,
    last_reported: u64,
}

impl DownloadProgress {
    fn new(total: Option<u64>) -> Self {
        Self {
            total: total.filter(|&t| t > 0),
            received: 0,
            last_reported: 0,
        }
    }

    fn advance(&mut self, bytes: u64) -> Option<u64> {
        self.received += bytes;
        let total = self.total?;
        let percent = self.received.saturating_mul(100) / total;

        if percent >= self.last_reported + 10 {
            self.last_reported = percent;
            Some(percent)
        } else {
            None
        }
    }
}
