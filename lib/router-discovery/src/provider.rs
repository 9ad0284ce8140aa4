//! Discovery provider interface

use crate::Result;
use async_trait::async_trait;
use router_core::BackendInstance;
use serde::{Deserialize, Serialize};

/// How the gateway announces itself to the discovery provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub service_id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub health_check_url: String,
}

impl Registration {
    /// Whether a provider record describes this registration
    pub fn matches(&self, record: &HealthRecord) -> bool {
        record.instance_id == self.service_id
            || (record.host == self.host && record.port == self.port)
    }
}

/// Aggregated health of one instance as reported by the provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
    Maintenance,
}

impl HealthStatus {
    /// Only passing instances receive traffic
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Passing)
    }
}

/// One instance entry from a health-by-name lookup
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub aggregated_status: HealthStatus,
    #[serde(default)]
    pub health_check_outputs: Vec<String>,
    /// Health URL the instance registered with, if the provider reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
}

impl HealthRecord {
    pub fn is_healthy(&self) -> bool {
        self.aggregated_status.is_healthy()
    }

    pub fn same_address(&self, instance: &BackendInstance) -> bool {
        instance.has_address(&self.host, self.port)
    }

    /// Backend instance for this record
    pub fn to_instance(&self) -> BackendInstance {
        BackendInstance {
            id: self.instance_id.clone(),
            host: self.host.clone(),
            port: self.port,
            health_endpoint: self.health_check_url.clone(),
        }
    }
}

/// External discovery system reporting which instances are healthy
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Register an instance with the provider
    async fn register(&self, registration: &Registration) -> Result<()>;

    /// Health records of every known instance of a service
    async fn health_check_by_name(&self, service_name: &str) -> Result<Vec<HealthRecord>>;
}
