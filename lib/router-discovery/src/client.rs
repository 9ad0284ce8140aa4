//! HTTP/JSON discovery provider client

use crate::provider::{DiscoveryProvider, HealthRecord, Registration};
use crate::{DiscoveryError, Result};
use async_trait::async_trait;
use reqwest::{Response, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Discovery provider connection settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Base URL of the discovery HTTP API
    pub base_url: String,
    /// Timeout applied to every provider request
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Discovery provider speaking a generic JSON API:
///
/// - `PUT {base}/v1/agent/service/register` with a [`Registration`] body
/// - `GET {base}/v1/health/service/{name}` returning a list of [`HealthRecord`]s
pub struct HttpDiscoveryClient {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpDiscoveryClient {
    /// Create a new discovery client
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| DiscoveryError::Config(format!("{}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(DiscoveryError::Config(format!(
                "{} cannot be used as a base URL",
                config.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build `{base}/{segments...}`, percent-encoding each segment
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DiscoveryError::Response {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl DiscoveryProvider for HttpDiscoveryClient {
    async fn register(&self, registration: &Registration) -> Result<()> {
        let url = self.endpoint(&["v1", "agent", "service", "register"]);
        let response = self.client.put(url).json(registration).send().await?;
        Self::check_status(response).await?;

        debug!(
            "Registered {} ({}) with discovery",
            registration.service_id, registration.service_name
        );
        Ok(())
    }

    async fn health_check_by_name(&self, service_name: &str) -> Result<Vec<HealthRecord>> {
        let url = self.endpoint(&["v1", "health", "service", service_name]);
        let response = self.client.get(url).send().await?;
        let body = Self::check_status(response).await?.text().await?;
        let records: Vec<HealthRecord> = serde_json::from_str(&body)?;

        debug!("Discovery reported {} records for {}", records.len(), service_name);
        Ok(records)
    }
}
