//! Release metadata lookup.
//!
//! Both release endpoints speak the GitHub releases JSON shape. The client
//! endpoint returns a list, the supervisor endpoint returns a single `latest`
//! object; [`ReleaseSource`] accepts either.

use crate::types::Release;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

pub const USER_AGENT: &str = concat!("newtsvc/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("release request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("no releases found at {url}")]
    NotFound { url: String },
    #[error("release request to {url} failed with status {status}")]
    Status { url: String, status: StatusCode },
    #[error("could not decode release metadata from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("no {kind}release listed at {url}")]
    Empty { url: String, kind: &'static str },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReleasePayload {
    Many(Vec<Release>),
    One(Release),
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Falling back to default HTTP client: {}", e);
            reqwest::Client::new()
        })
}

#[derive(Debug, Clone)]
pub struct ReleaseSource {
    client: reqwest::Client,
    url: String,
}

impl ReleaseSource {
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Latest applicable release, or `None` when nothing could be determined this time.
    pub async fn fetch_latest(&self, include_prerelease: bool) -> Option<Release> {
        match self.try_fetch_latest(include_prerelease).await {
            Ok(release) => {
                tracing::info!("Found release: {}", release.tag_name);
                Some(release)
            }
            Err(e) => {
                tracing::warn!("Failed to fetch releases: {}", e);
                None
            }
        }
    }

    pub async fn try_fetch_latest(&self, include_prerelease: bool) -> Result<Release, ReleaseError> {
        tracing::debug!("Fetching release info from: {}", self.url);

        let mut request = self
            .client
            .get(&self.url)
            .header("Accept", "application/vnd.github.v3+json");

        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            request = request.header("Authorization", format!("token {}", token));
            tracing::debug!("Using GITHUB_TOKEN");
        }

        let response = request.send().await.map_err(|source| ReleaseError::Request {
            url: self.url.clone(),
            source,
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ReleaseError::NotFound {
                url: self.url.clone(),
            });
        }
        if !status.is_success() {
            return Err(ReleaseError::Status {
                url: self.url.clone(),
                status,
            });
        }

        let payload: ReleasePayload = response.json().await.map_err(|source| ReleaseError::Decode {
            url: self.url.clone(),
            source,
        })?;

        pick_release(payload, include_prerelease).ok_or_else(|| ReleaseError::Empty {
            url: self.url.clone(),
            kind: if include_prerelease { "" } else { "stable " },
        })
    }
}

fn pick_release(payload: ReleasePayload, include_prerelease: bool) -> Option<Release> {
    match payload {
        // A single `latest` record has already been chosen by the server
        ReleasePayload::One(release) => Some(release),
        ReleasePayload::Many(releases) => releases
            .into_iter()
            .find(|release| include_prerelease || !release.prerelease),
    }
}
