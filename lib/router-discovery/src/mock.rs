//! In-memory discovery provider for tests

use crate::provider::{DiscoveryProvider, HealthRecord, HealthStatus, Registration};
use crate::{DiscoveryError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

pub(crate) fn registration() -> Registration {
    Registration {
        service_id: "gateway-1".to_string(),
        service_name: "gateway".to_string(),
        host: "10.0.0.100".to_string(),
        port: 8080,
        health_check_url: "http://10.0.0.100:8080/healthz".to_string(),
    }
}

pub(crate) fn record(id: &str, host: &str, port: u16, status: HealthStatus) -> HealthRecord {
    HealthRecord {
        instance_id: id.to_string(),
        host: host.to_string(),
        port,
        aggregated_status: status,
        health_check_outputs: Vec::new(),
        health_check_url: None,
    }
}

/// Provider whose answers are set by the test
#[derive(Default)]
pub(crate) struct MockProvider {
    records: Mutex<HashMap<String, Vec<HealthRecord>>>,
    failure: Mutex<Option<DiscoveryError>>,
    hang: AtomicBool,
    registrations: Mutex<Vec<Registration>>,
    lookups: AtomicUsize,
}

impl MockProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_records(&self, service_name: &str, records: Vec<HealthRecord>) {
        self.records
            .lock()
            .unwrap()
            .insert(service_name.to_string(), records);
    }

    /// Make every call fail with `err`
    pub(crate) fn fail_with(&self, err: DiscoveryError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    pub(crate) fn recover(&self) {
        *self.failure.lock().unwrap() = None;
        self.hang.store(false, Ordering::SeqCst);
    }

    /// Make every lookup wait forever
    pub(crate) fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub(crate) fn registrations(&self) -> Vec<Registration> {
        self.registrations.lock().unwrap().clone()
    }

    pub(crate) fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<()> {
        match self.failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DiscoveryProvider for MockProvider {
    async fn register(&self, registration: &Registration) -> Result<()> {
        self.check_failure()?;
        self.registrations.lock().unwrap().push(registration.clone());
        let own = record(
            &registration.service_id,
            &registration.host,
            registration.port,
            HealthStatus::Passing,
        );
        self.records
            .lock()
            .unwrap()
            .entry(registration.service_name.clone())
            .or_default()
            .push(own);
        Ok(())
    }

    async fn health_check_by_name(&self, service_name: &str) -> Result<Vec<HealthRecord>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.check_failure()?;
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(service_name)
            .cloned()
            .unwrap_or_default())
    }
}
