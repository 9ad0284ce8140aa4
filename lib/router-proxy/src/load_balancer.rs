//! Load balancing strategies for distributing traffic across backend instances

use rand::Rng;
use router_core::{BackendInstance, CoreError, Result, ServiceRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Uniform random pick
    Random,
    /// Per-service cursor, `cursor % len`
    #[default]
    RoundRobin,
    /// CRC32 of a key, `checksum % len`
    Hash,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingStrategy::Random => "random",
            LoadBalancingStrategy::RoundRobin => "round_robin",
            LoadBalancingStrategy::Hash => "hash",
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load balancer that resolves a service name to one of its registered instances
///
/// Strategies are assigned once per service name. Services without an
/// assignment use round-robin.
pub struct LoadBalancer {
    registry: Arc<ServiceRegistry>,
    strategies: RwLock<HashMap<String, LoadBalancingStrategy>>,
    // Round-robin cursors; u16 so the cursor wraps at 65536
    cursors: RwLock<HashMap<String, Arc<AtomicU16>>>,
}

impl LoadBalancer {
    /// Create a new load balancer reading from the given registry
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            strategies: RwLock::new(HashMap::new()),
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Assign a strategy to a service; an assignment cannot be changed later
    pub async fn register_strategy(
        &self,
        service_name: &str,
        strategy: LoadBalancingStrategy,
    ) -> Result<()> {
        let mut strategies = self.strategies.write().await;
        match strategies.get(service_name) {
            Some(existing) if *existing != strategy => Err(CoreError::InvalidConfiguration(format!(
                "service {} already uses the {} strategy",
                service_name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                info!("Service {} uses {} load balancing", service_name, strategy);
                strategies.insert(service_name.to_string(), strategy);
                Ok(())
            }
        }
    }

    /// Strategy in effect for a service
    pub async fn strategy(&self, service_name: &str) -> LoadBalancingStrategy {
        let strategies = self.strategies.read().await;
        strategies.get(service_name).copied().unwrap_or_default()
    }

    /// Pick one instance of a service
    ///
    /// The hash strategy draws a fresh random key on every call here, so it
    /// spreads like random selection. Use `resolve_with_key` for sticky routing.
    pub async fn resolve(&self, service_name: &str) -> Result<BackendInstance> {
        let strategy = self.strategy(service_name).await;
        let key = match strategy {
            LoadBalancingStrategy::Hash => Some(Self::random_key()),
            _ => None,
        };
        self.select(service_name, strategy, key.as_deref()).await
    }

    /// Pick one instance of a service, hashing `key` when the service uses the hash strategy
    pub async fn resolve_with_key(&self, service_name: &str, key: &str) -> Result<BackendInstance> {
        let strategy = self.strategy(service_name).await;
        self.select(service_name, strategy, Some(key)).await
    }

    async fn select(
        &self,
        service_name: &str,
        strategy: LoadBalancingStrategy,
        key: Option<&str>,
    ) -> Result<BackendInstance> {
        // The cursor moves on every call, even when nothing can be selected.
        // It is read independently of the list length, so a concurrent
        // resize may skip or repeat an instance.
        let cursor = match strategy {
            LoadBalancingStrategy::RoundRobin => Some(self.advance_cursor(service_name).await),
            _ => None,
        };

        let instances = self.registry.list(service_name).await;
        let selected = match (strategy, cursor, key) {
            (LoadBalancingStrategy::RoundRobin, Some(cursor), _) => {
                Self::select_round_robin(&instances, cursor)
            }
            (LoadBalancingStrategy::Hash, _, Some(key)) => Self::select_by_hash(&instances, key),
            _ => Self::select_random(&instances),
        };

        match selected {
            Some(instance) => {
                debug!(
                    "Selected {} ({}) for {} via {}",
                    instance.id,
                    instance.address(),
                    service_name,
                    strategy
                );
                Ok(instance.clone())
            }
            None => Err(CoreError::NoBackendAvailable(service_name.to_string())),
        }
    }

    /// Return the current cursor value and advance it by one
    async fn advance_cursor(&self, service_name: &str) -> u16 {
        let existing = {
            let cursors = self.cursors.read().await;
            cursors.get(service_name).cloned()
        };
        let cursor = match existing {
            Some(cursor) => cursor,
            None => {
                let mut cursors = self.cursors.write().await;
                cursors
                    .entry(service_name.to_string())
                    .or_insert_with(|| Arc::new(AtomicU16::new(0)))
                    .clone()
            }
        };
        // fetch_add on AtomicU16 wraps on overflow
        cursor.fetch_add(1, Ordering::Relaxed)
    }

    /// Select uniformly at random
    pub fn select_random(instances: &[BackendInstance]) -> Option<&BackendInstance> {
        if instances.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..instances.len());
        instances.get(index)
    }

    /// Select the instance at `cursor % len`
    pub fn select_round_robin(instances: &[BackendInstance], cursor: u16) -> Option<&BackendInstance> {
        if instances.is_empty() {
            return None;
        }
        instances.get(cursor as usize % instances.len())
    }

    /// Hash-based selection; equal keys map to equal positions for a fixed list
    pub fn select_by_hash<'a>(instances: &'a [BackendInstance], key: &str) -> Option<&'a BackendInstance> {
        if instances.is_empty() {
            return None;
        }
        let checksum = Self::compute_hash(key);
        instances.get(checksum as usize % instances.len())
    }

    /// CRC32 (IEEE) checksum of a key
    fn compute_hash(key: &str) -> u32 {
        crc32fast::hash(key.as_bytes())
    }

    fn random_key() -> String {
        format!("{:016x}", rand::random::<u64>())
    }
}
