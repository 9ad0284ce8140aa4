//! Gateway configuration loaded from YAML

use anyhow::{bail, Context, Result};
use router_core::BackendInstance;
use router_discovery::{DiscoveryConfig, ReconcileConfig, Registration};
use router_proxy::{AdmissionConfig, HealthCheckConfig, LoadBalancingStrategy};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "ROUTER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "router.yaml";

#[derive(Clone, Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// How the gateway registers itself with discovery
    #[serde(rename = "self", default)]
    pub registration: SelfConfig,
    /// Discovery provider; without it reconciliation only self-checks
    #[serde(default)]
    pub discovery: Option<DiscoveryConfig>,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(with = "humantime_serde", default = "default_forward_timeout")]
    pub forward_timeout: Duration,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SelfConfig {
    /// Defaults to `{service_name}-{random uuid}`
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_host")]
    pub host: String,
    /// Defaults to the listen port
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

impl Default for SelfConfig {
    fn default() -> Self {
        Self {
            service_id: None,
            service_name: default_service_name(),
            host: default_host(),
            port: None,
            health_path: default_health_path(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub strategy: LoadBalancingStrategy,
    /// Instances known before the first reconciliation pass
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub health_endpoint: Option<String>,
}

impl From<&InstanceConfig> for BackendInstance {
    fn from(config: &InstanceConfig) -> Self {
        BackendInstance {
            id: config.id.clone(),
            host: config.host.clone(),
            port: config.port,
            health_endpoint: config.health_endpoint.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RouteConfig {
    /// Path pattern: exact, `/prefix/` or `/prefix/*`
    pub path: String,
    pub service: String,
    /// Allowed methods; empty allows all
    #[serde(default)]
    pub methods: Vec<String>,
    /// Admission key; defaults to the path pattern
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub limit: Option<AdmissionConfig>,
}

impl RouteConfig {
    pub fn route_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.path)
    }
}

fn default_listen() -> SocketAddr {
    ([0, 0, 0, 0], 8080).into()
}

fn default_forward_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_service_name() -> String {
    "router-gateway".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            registration: SelfConfig::default(),
            discovery: None,
            reconcile: ReconcileConfig::default(),
            health_check: HealthCheckConfig::default(),
            forward_timeout: default_forward_timeout(),
            services: Vec::new(),
            routes: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load from `$ROUTER_CONFIG` or `router.yaml`; a missing file gives defaults
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = Self::from_yaml(&raw).with_context(|| format!("parsing {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.reconcile.validate()?;

        if self.health_check.timeout.is_zero() {
            bail!("health_check timeout must be positive");
        }
        if self.forward_timeout.is_zero() {
            bail!("forward_timeout must be positive");
        }
        if let Some(discovery) = &self.discovery {
            if discovery.request_timeout.is_zero() {
                bail!("discovery request_timeout must be positive");
            }
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                bail!("service {} is declared twice", service.name);
            }
        }

        let mut limited = HashSet::new();
        for route in &self.routes {
            if !names.contains(route.service.as_str()) {
                bail!("route {} targets undeclared service {}", route.path, route.service);
            }
            if let Some(limit) = &route.limit {
                limit.validate()?;
                // Routes sharing a key share one limiter
                if !limited.insert(route.route_key()) {
                    bail!("admission key {} has more than one limit", route.route_key());
                }
            }
        }
        Ok(())
    }

    /// The gateway's own discovery registration
    pub fn registration(&self) -> Registration {
        let own = &self.registration;
        let port = own.port.unwrap_or_else(|| self.listen.port());
        Registration {
            service_id: own
                .service_id
                .clone()
                .unwrap_or_else(|| format!("{}-{}", own.service_name, uuid::Uuid::new_v4())),
            service_name: own.service_name.clone(),
            host: own.host.clone(),
            port,
            health_check_url: format!("http://{}:{}{}", own.host, port, own.health_path),
        }
    }
}
