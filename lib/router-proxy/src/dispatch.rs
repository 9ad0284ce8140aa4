//! Gateway dispatch: backend resolution, route admission and instance administration

use crate::admission::{AdmissionConfig, AdmissionError, AdmissionLimiter};
use crate::load_balancer::{LoadBalancer, LoadBalancingStrategy};
use crate::metrics::MetricsCollector;
use router_core::{BackendInstance, CoreError, Result, ServiceRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Entry point used by the transport layer to route requests
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    load_balancer: LoadBalancer,
    limiters: RwLock<HashMap<String, Arc<AdmissionLimiter>>>,
    metrics: MetricsCollector,
}

impl Dispatcher {
    /// Create a dispatcher over a shared registry
    pub fn new(registry: Arc<ServiceRegistry>, metrics: MetricsCollector) -> Self {
        Self {
            load_balancer: LoadBalancer::new(registry.clone()),
            registry,
            limiters: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Resolve a backend for a service
    pub async fn resolve(&self, service_name: &str) -> Result<BackendInstance> {
        let result = self.load_balancer.resolve(service_name).await;
        self.metrics.record_resolve(service_name, result.is_ok());
        result
    }

    /// Resolve a backend using a caller-supplied affinity key
    pub async fn resolve_with_key(&self, service_name: &str, key: &str) -> Result<BackendInstance> {
        let result = self.load_balancer.resolve_with_key(service_name, key).await;
        self.metrics.record_resolve(service_name, result.is_ok());
        result
    }

    /// Install or replace the admission limit for a route
    pub async fn set_route_limit(&self, route_key: &str, config: AdmissionConfig) -> Result<()> {
        let limiter = AdmissionLimiter::new(route_key, config)?;
        let mut limiters = self.limiters.write().await;
        if limiters
            .insert(route_key.to_string(), Arc::new(limiter))
            .is_some()
        {
            warn!("Admission limit for route {} replaced", route_key);
        } else {
            info!("Admission limit installed for route {}", route_key);
        }
        Ok(())
    }

    /// Wait until a request on `route_key` may proceed
    ///
    /// Routes without a limit are admitted immediately.
    pub async fn admit(&self, route_key: &str) -> std::result::Result<(), AdmissionError> {
        let limiter = {
            let limiters = self.limiters.read().await;
            limiters.get(route_key).cloned()
        };
        let limiter = match limiter {
            Some(limiter) => limiter,
            None => return Ok(()),
        };

        let started = Instant::now();
        limiter.admit().await?;
        let waited = started.elapsed();
        debug!("Admitted request on {} after {:?}", route_key, waited);
        self.metrics.record_admission_wait(route_key, waited.as_secs_f64());
        Ok(())
    }

    /// Register a service's load balancing strategy and start tracking it
    pub async fn register_strategy(
        &self,
        service_name: &str,
        strategy: LoadBalancingStrategy,
    ) -> Result<()> {
        self.load_balancer.register_strategy(service_name, strategy).await?;
        self.registry.get_or_create(service_name).await;
        Ok(())
    }

    /// Add or replace an instance by administrative request
    pub async fn add_instance(&self, service_name: &str, instance: BackendInstance) {
        let entry = self.registry.get_or_create(service_name).await;
        entry.add(instance).await;
        self.metrics.set_instances(service_name, entry.len().await);
    }

    /// Remove an instance by id
    pub async fn remove_instance(&self, service_name: &str, id: &str) -> Result<BackendInstance> {
        let removed = self.registry.remove(service_name, id).await.ok_or_else(|| {
            CoreError::InstanceNotFound {
                service: service_name.to_string(),
                id: id.to_string(),
            }
        })?;
        self.metrics
            .set_instances(service_name, self.registry.list(service_name).await.len());
        Ok(removed)
    }

    /// Current instances of a service
    pub async fn list_instances(&self, service_name: &str) -> Vec<BackendInstance> {
        self.registry.list(service_name).await.as_ref().clone()
    }
}
