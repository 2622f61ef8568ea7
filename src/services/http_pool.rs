//! Shared HTTP client pool.
//!
//! One pooled `reqwest::Client` for every external-service adapter, so TCP
//! connections are reused via keep-alive and concurrency stays bounded.
//! Built once at startup and injected; never an ambient singleton.

use std::time::Duration;

use crate::config::HttpPoolSettings;
use crate::error::Result;

pub struct HttpClientPool {
    client: reqwest::Client,
    settings: HttpPoolSettings,
}

impl HttpClientPool {
    pub fn new(settings: HttpPoolSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .pool_idle_timeout(settings.idle_timeout)
            .build()
            .map_err(|e| {
                crate::error::AppError::Configuration(format!("http client build failed: {e}"))
            })?;

        tracing::info!(
            timeout_secs = settings.request_timeout.as_secs(),
            max_idle_per_host = settings.max_idle_per_host,
            "HTTP client pool initialized"
        );

        Ok(Self { client, settings })
    }

    /// The shared client. Cheap to clone; all clones share the pool.
    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    pub fn request_timeout(&self) -> Duration {
        self.settings.request_timeout
    }
}
