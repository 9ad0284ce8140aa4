//! Reconciliation passes that bring the registry in line with observed health

use crate::provider::{DiscoveryProvider, HealthRecord, Registration};
use crate::Result;
use futures::future::{join_all, try_join_all};
use router_core::{BackendInstance, ServiceRegistry};
use router_proxy::{HealthChecker, MetricsCollector};
use std::ops::AddAssign;
use std::sync::Arc;
use tracing::{debug, info};

/// Changes made by one pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub services: usize,
    pub added: usize,
    pub removed: usize,
}

impl AddAssign for PassReport {
    fn add_assign(&mut self, other: Self) {
        self.services += other.services;
        self.added += other.added;
        self.removed += other.removed;
    }
}

/// Applies discovery answers or local probe results to the registry
pub struct Reconciler {
    registry: Arc<ServiceRegistry>,
    provider: Option<Arc<dyn DiscoveryProvider>>,
    health_checker: HealthChecker,
    registration: Registration,
    metrics: MetricsCollector,
}

impl Reconciler {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        provider: Option<Arc<dyn DiscoveryProvider>>,
        health_checker: HealthChecker,
        registration: Registration,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            registry,
            provider,
            health_checker,
            registration,
            metrics,
        }
    }

    pub fn provider(&self) -> Option<&Arc<dyn DiscoveryProvider>> {
        self.provider.as_ref()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// One discovery-backed pass over every tracked service
    ///
    /// Any provider failure aborts the pass; services already reconciled
    /// keep their changes.
    pub async fn discovery_pass(&self, provider: &dyn DiscoveryProvider) -> Result<PassReport> {
        self.ensure_registered(provider).await?;

        let names = self.registry.service_names().await;
        let reports = try_join_all(
            names
                .iter()
                .map(|name| self.reconcile_service(provider, name)),
        )
        .await?;

        let mut total = PassReport::default();
        for report in reports {
            total += report;
        }
        Ok(total)
    }

    /// Re-register the gateway if the provider no longer lists it
    async fn ensure_registered(&self, provider: &dyn DiscoveryProvider) -> Result<()> {
        let records = provider
            .health_check_by_name(&self.registration.service_name)
            .await?;
        if records.iter().any(|record| self.registration.matches(record)) {
            return Ok(());
        }

        info!(
            "Registration {} not visible in discovery, registering",
            self.registration.service_id
        );
        provider.register(&self.registration).await
    }

    /// Reconcile one service against the provider's answer
    pub async fn reconcile_service(
        &self,
        provider: &dyn DiscoveryProvider,
        service_name: &str,
    ) -> Result<PassReport> {
        let records = provider.health_check_by_name(service_name).await?;
        if records.is_empty() {
            // An empty answer leaves the local list alone
            debug!("Discovery has no records for {}, skipping", service_name);
            return Ok(PassReport::default());
        }
        Ok(self.apply_records(service_name, &records).await)
    }

    /// Apply a non-empty set of health records to one service
    ///
    /// Unhealthy addresses are dropped, healthy ones added when missing, and
    /// finally anything not reported healthy is removed.
    pub async fn apply_records(&self, service_name: &str, records: &[HealthRecord]) -> PassReport {
        let entry = self.registry.get_or_create(service_name).await;

        let unhealthy = entry
            .retain(|instance| {
                !records
                    .iter()
                    .any(|record| !record.is_healthy() && record.same_address(instance))
            })
            .await;

        let mut added = 0;
        for record in records.iter().filter(|record| record.is_healthy()) {
            if entry.ensure(record.to_instance()).await {
                added += 1;
            }
        }

        let stale = entry
            .retain(|instance| {
                records
                    .iter()
                    .any(|record| record.is_healthy() && record.same_address(instance))
            })
            .await;

        let report = PassReport {
            services: 1,
            added,
            removed: unhealthy.len() + stale.len(),
        };
        if report.added > 0 || report.removed > 0 {
            info!(
                "Reconciled {} from discovery: +{} -{}",
                service_name, report.added, report.removed
            );
        }
        self.metrics.set_instances(service_name, entry.len().await);
        report
    }

    /// Whether the provider answers a lookup for the gateway itself
    pub async fn discovery_available(&self, provider: &dyn DiscoveryProvider) -> bool {
        provider
            .health_check_by_name(&self.registration.service_name)
            .await
            .is_ok()
    }

    /// One self-checked pass: probe every instance and drop the failures
    pub async fn self_check_pass(&self) -> PassReport {
        let names = self.registry.service_names().await;
        let reports = join_all(names.iter().map(|name| self.self_check_service(name))).await;

        let mut total = PassReport::default();
        for report in reports {
            total += report;
        }
        total
    }

    /// Probe one service's instances; instances without a health endpoint
    /// cannot be verified and are removed
    pub async fn self_check_service(&self, service_name: &str) -> PassReport {
        let snapshot = self.registry.list(service_name).await;
        let results = join_all(snapshot.iter().map(|instance| async move {
            (instance, self.health_checker.check_instance(instance).await)
        }))
        .await;

        let failed: Vec<&BackendInstance> = results
            .into_iter()
            .filter(|(_, healthy)| !healthy)
            .map(|(instance, _)| instance)
            .collect();

        let removed = if failed.is_empty() {
            Vec::new()
        } else {
            self.registry
                .retain(service_name, |instance| !failed.contains(&instance))
                .await
        };

        if !removed.is_empty() {
            info!("Self check removed {} instances of {}", removed.len(), service_name);
        }
        self.metrics
            .set_instances(service_name, self.registry.list(service_name).await.len());

        PassReport {
            services: 1,
            added: 0,
            removed: removed.len(),
        }
    }
}
