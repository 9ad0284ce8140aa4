//! Backend instance model
use serde::{Deserialize, Serialize};

/// One reachable replica of a named service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInstance {
    pub id: String,
    pub host: String,
    pub port: u16,
    /// URL probed when the gateway verifies the instance itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
}

impl BackendInstance {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            health_endpoint: None,
        }
    }

    pub fn with_health_endpoint(mut self, url: impl Into<String>) -> Self {
        self.health_endpoint = Some(url.into());
        self
    }

    /// `host:port` form used in target URLs and logs
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address identity, used by discovery reconciliation
    pub fn has_address(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }

    /// True when `other` collides with this instance under either identity rule
    pub fn conflicts_with(&self, other: &BackendInstance) -> bool {
        self.id == other.id || self.has_address(&other.host, other.port)
    }
}
