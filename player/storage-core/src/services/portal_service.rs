use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;

use crate::models::PortalData;

/// Where the launch/session data for the current learner comes from.
#[async_trait]
pub trait PortalDataSource: Send + Sync {
    async fn fetch_portal_data(&self) -> Result<PortalData>;
}

/// Portal data known up front (tests, previews, embedded launches).
pub struct StaticPortalData {
    data: PortalData,
}

impl StaticPortalData {
    pub fn new(data: PortalData) -> Self {
        Self { data }
    }
}

#[async_trait]
impl PortalDataSource for StaticPortalData {
    async fn fetch_portal_data(&self) -> Result<PortalData> {
        let mut data = self.data.clone();
        data.decode_portal_jwt()?;
        Ok(data)
    }
}

/// Used when nothing is configured; storage then runs unauthenticated.
pub struct NoPortalData;

#[async_trait]
impl PortalDataSource for NoPortalData {
    async fn fetch_portal_data(&self) -> Result<PortalData> {
        anyhow::bail!("no portal data source configured")
    }
}

/// Portal data saved to disk by a previous online launch.
pub struct FilePortalData {
    path: PathBuf,
}

impl FilePortalData {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PortalDataSource for FilePortalData {
    async fn fetch_portal_data(&self) -> Result<PortalData> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read portal data from {}", self.path.display()))?;
        let mut data: PortalData =
            serde_json::from_str(&raw).context("Failed to parse portal data file")?;
        data.decode_portal_jwt()?;
        Ok(data)
    }
}

/// Portal data fetched from the portal's launch endpoint.
pub struct HttpPortalData {
    http_client: Client,
    url: String,
    token: Option<String>,
}

impl HttpPortalData {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http_client: Client::new(),
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl PortalDataSource for HttpPortalData {
    async fn fetch_portal_data(&self) -> Result<PortalData> {
        let mut request = self.http_client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .context("Failed to reach portal")?
            .error_for_status()
            .context("Portal rejected the launch data request")?;
        let mut data: PortalData = response
            .json()
            .await
            .context("Failed to parse portal launch data")?;
        data.decode_portal_jwt()?;

        tracing::info!(source_key = data.source_key(), "Portal data fetched");
        Ok(data)
    }
}
