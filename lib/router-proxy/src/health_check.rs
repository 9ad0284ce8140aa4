//! Health checking for backend instances

use router_core::BackendInstance;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

/// Health check configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Timeout for a single probe
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
        }
    }
}

/// Health checker that probes an instance's recorded health endpoint
#[derive(Clone)]
pub struct HealthChecker {
    config: HealthCheckConfig,
    client: reqwest::Client,
}

impl HealthChecker {
    /// Create a new health checker
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Probe an instance; instances without a health endpoint cannot be verified
    pub async fn check_instance(&self, instance: &BackendInstance) -> bool {
        let url = match instance.health_endpoint.as_deref() {
            Some(url) => url,
            None => {
                debug!("Instance {} has no health endpoint", instance.id);
                return false;
            }
        };

        match time::timeout(self.config.timeout, self.check_single(url)).await {
            Ok(Ok(healthy)) => {
                if healthy {
                    debug!("Instance {} ({}) is healthy", instance.id, instance.address());
                    true
                } else {
                    warn!("Instance {} ({}) health check failed", instance.id, instance.address());
                    false
                }
            }
            Ok(Err(e)) => {
                warn!("Instance {} ({}) health check error: {}", instance.id, instance.address(), e);
                false
            }
            Err(_) => {
                warn!("Instance {} ({}) health check timeout", instance.id, instance.address());
                false
            }
        }
    }

    /// Any 2xx answer counts as healthy
    async fn check_single(&self, url: &str) -> Result<bool, reqwest::Error> {
        let response = self.client.get(url).send().await?;
        Ok(response.status().is_success())
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(HealthCheckConfig::default())
    }
}
