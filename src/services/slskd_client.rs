//! slskd REST adapter for the external download client contract.
//!
//! Talks to the slskd daemon's HTTP API using the shared client pool. The
//! downloads endpoint groups files by user and directory; this adapter
//! flattens that into the provider-agnostic `ExternalDownload` records the
//! workers consume.

use async_trait::async_trait;
use serde::Deserialize;

use super::download_client::{ExternalDownload, ExternalDownloadClient};
use crate::config::SlskdSettings;
use crate::error::{AppError, Result};

const API_KEY_HEADER: &str = "X-API-Key";

pub struct SlskdClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserTransfers {
    username: String,
    #[serde(default)]
    directories: Vec<DirectoryTransfers>,
}

#[derive(Debug, Deserialize)]
struct DirectoryTransfers {
    #[serde(default)]
    files: Vec<FileTransfer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileTransfer {
    #[serde(default)]
    id: Option<String>,
    filename: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    bytes_transferred: u64,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    percent_complete: f64,
    #[serde(default)]
    exception: Option<String>,
}

impl SlskdClient {
    pub fn new(http: reqwest::Client, settings: &SlskdSettings) -> Self {
        Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder
    }

    fn flatten(users: Vec<UserTransfers>) -> Vec<ExternalDownload> {
        let mut downloads = Vec::new();
        for user in users {
            for dir in user.directories {
                for file in dir.files {
                    // Some slskd builds omit the transfer id; fall back to
                    // the username/filename fingerprint the workers match on
                    let external_id = file
                        .id
                        .unwrap_or_else(|| format!("{}/{}", user.username, file.filename));
                    downloads.push(ExternalDownload {
                        external_id,
                        filename: file.filename,
                        username: Some(user.username.clone()),
                        state: file.state,
                        bytes_transferred: file.bytes_transferred,
                        total_bytes: file.size,
                        progress_percent: file.percent_complete,
                        error_message: file.exception,
                    });
                }
            }
        }
        downloads
    }

    fn service_error(&self, message: impl Into<String>) -> AppError {
        AppError::ExternalService {
            service: "slskd".to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl ExternalDownloadClient for SlskdClient {
    fn name(&self) -> &str {
        "slskd"
    }

    async fn is_available(&self) -> bool {
        match self
            .request(reqwest::Method::GET, "/api/v0/application")
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "slskd availability probe failed");
                false
            }
        }
    }

    async fn list_downloads(&self) -> Result<Vec<ExternalDownload>> {
        let response = self
            .request(reqwest::Method::GET, "/api/v0/transfers/downloads")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.service_error(format!(
                "listing downloads returned {}",
                response.status()
            )));
        }

        let users: Vec<UserTransfers> = response.json().await?;
        Ok(Self::flatten(users))
    }

    async fn get_download(&self, external_id: &str) -> Result<Option<ExternalDownload>> {
        let downloads = self.list_downloads().await?;
        Ok(downloads.into_iter().find(|d| d.external_id == external_id))
    }

    async fn enqueue(&self, username: &str, filename: &str) -> Result<String> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v0/transfers/downloads/{username}"),
            )
            .json(&serde_json::json!([{ "filename": filename }]))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.service_error(format!(
                "enqueue for {username} returned {}",
                response.status()
            )));
        }

        // slskd identifies the transfer by user and path; callers reconcile
        // the daemon-assigned id on the next status poll
        Ok(format!("{username}/{filename}"))
    }

    async fn cancel(&self, external_id: &str) -> Result<()> {
        let Some((username, file_id)) = external_id.split_once('/') else {
            return Err(AppError::Validation(format!(
                "malformed external id: {external_id}"
            )));
        };

        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/api/v0/transfers/downloads/{username}/{file_id}"),
            )
            .send()
            .await?;

        // 404 means the transfer is already gone, which is fine for cancel
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(self.service_error(format!(
                "cancel of {external_id} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
