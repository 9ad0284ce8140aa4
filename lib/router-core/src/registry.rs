//! Service registry for managing backend instances per service name

use crate::BackendInstance;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// ServiceRegistry maintains the live instance list of every tracked service
///
/// The registry is an explicit object shared by `Arc`; the reconciliation
/// supervisor mutates it and the dispatch layer reads from it.
pub struct ServiceRegistry {
    // Map of service name to its entry
    services: Arc<RwLock<HashMap<String, Arc<ServiceEntry>>>>,
}

/// Instance list for one service name
///
/// The list is copy-on-write: readers take an `Arc` snapshot and never block
/// writers for longer than the pointer clone. All structural changes to one
/// entry are serialized by its write lock.
#[derive(Debug)]
pub struct ServiceEntry {
    name: String,
    instances: RwLock<Arc<Vec<BackendInstance>>>,
}

impl ServiceEntry {
    fn new(name: String) -> Self {
        Self {
            name,
            instances: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the current instance list
    pub async fn snapshot(&self) -> Arc<Vec<BackendInstance>> {
        self.instances.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Insert an instance, replacing any instance that shares its id or address
    ///
    /// The replacement keeps the position of the first conflicting instance;
    /// without a conflict the instance is appended.
    pub async fn add(&self, instance: BackendInstance) {
        let mut guard = self.instances.write().await;
        let list = Arc::make_mut(&mut guard);
        debug!("Adding instance {} ({}) to {}", instance.id, instance.address(), self.name);
        upsert(list, instance);
    }

    /// Insert an instance unless one with the same address is already present
    ///
    /// Identity here is the address alone; a shared id never replaces an
    /// instance at another address. Returns true if the list changed.
    pub async fn ensure(&self, instance: BackendInstance) -> bool {
        let mut guard = self.instances.write().await;
        if guard
            .iter()
            .any(|existing| existing.has_address(&instance.host, instance.port))
        {
            return false;
        }
        debug!("Discovered instance {} ({}) for {}", instance.id, instance.address(), self.name);
        Arc::make_mut(&mut guard).push(instance);
        true
    }

    /// Remove by position in the list as seen under the write lock
    pub async fn remove_at(&self, position: usize) -> Option<BackendInstance> {
        let mut guard = self.instances.write().await;
        if position >= guard.len() {
            return None;
        }
        let removed = Arc::make_mut(&mut guard).remove(position);
        debug!("Removed instance {} at position {} from {}", removed.id, position, self.name);
        Some(removed)
    }

    /// Remove the instance with the given id
    pub async fn remove(&self, id: &str) -> Option<BackendInstance> {
        let mut guard = self.instances.write().await;
        let position = guard.iter().position(|instance| instance.id == id)?;
        let removed = Arc::make_mut(&mut guard).remove(position);
        debug!("Removed instance {} from {}", removed.id, self.name);
        Some(removed)
    }

    /// Keep only the instances matching `keep`, returning the ones dropped
    pub async fn retain<F>(&self, mut keep: F) -> Vec<BackendInstance>
    where
        F: FnMut(&BackendInstance) -> bool,
    {
        let mut guard = self.instances.write().await;
        let (kept, removed): (Vec<_>, Vec<_>) =
            guard.iter().cloned().partition(|instance| keep(instance));
        if removed.is_empty() {
            return removed;
        }
        *guard = Arc::new(kept);

        for instance in &removed {
            debug!("Removed instance {} ({}) from {}", instance.id, instance.address(), self.name);
        }
        removed
    }
}

fn upsert(list: &mut Vec<BackendInstance>, instance: BackendInstance) {
    match list.iter().position(|existing| existing.conflicts_with(&instance)) {
        Some(first) => {
            let mut index = 0;
            list.retain(|existing| {
                let keep = index <= first || !existing.conflicts_with(&instance);
                index += 1;
                keep
            });
            list[first] = instance;
        }
        None => list.push(instance),
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the entry for a service, creating an empty one on first use
    pub async fn get_or_create(&self, service_name: &str) -> Arc<ServiceEntry> {
        if let Some(entry) = self.entry(service_name).await {
            return entry;
        }

        let mut services = self.services.write().await;
        services
            .entry(service_name.to_string())
            .or_insert_with(|| {
                debug!("Tracking service: {}", service_name);
                Arc::new(ServiceEntry::new(service_name.to_string()))
            })
            .clone()
    }

    /// Get the entry for a service without creating it
    pub async fn entry(&self, service_name: &str) -> Option<Arc<ServiceEntry>> {
        let services = self.services.read().await;
        services.get(service_name).cloned()
    }

    /// Add or replace an instance of a service
    pub async fn add(&self, service_name: &str, instance: BackendInstance) {
        self.get_or_create(service_name).await.add(instance).await;
    }

    /// Add a discovered instance unless its address is already known
    pub async fn ensure(&self, service_name: &str, instance: BackendInstance) -> bool {
        self.get_or_create(service_name).await.ensure(instance).await
    }

    /// Remove an instance by position
    pub async fn remove_at(&self, service_name: &str, position: usize) -> Option<BackendInstance> {
        self.entry(service_name).await?.remove_at(position).await
    }

    /// Remove an instance by id
    pub async fn remove(&self, service_name: &str, id: &str) -> Option<BackendInstance> {
        self.entry(service_name).await?.remove(id).await
    }

    /// Filter a service's instances, returning the removed ones
    pub async fn retain<F>(&self, service_name: &str, keep: F) -> Vec<BackendInstance>
    where
        F: FnMut(&BackendInstance) -> bool,
    {
        match self.entry(service_name).await {
            Some(entry) => entry.retain(keep).await,
            None => Vec::new(),
        }
    }

    /// Snapshot of a service's instances; unknown services yield an empty list
    pub async fn list(&self, service_name: &str) -> Arc<Vec<BackendInstance>> {
        match self.entry(service_name).await {
            Some(entry) => entry.snapshot().await,
            None => Arc::new(Vec::new()),
        }
    }

    /// Names of every tracked service, sorted
    pub async fn service_names(&self) -> Vec<String> {
        let services = self.services.read().await;
        let mut names: Vec<String> = services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get count of tracked services
    pub async fn service_count(&self) -> usize {
        let services = self.services.read().await;
        services.len()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, host: &str, port: u16) -> BackendInstance {
        BackendInstance::new(id, host, port)
    }

    async fn ids(registry: &ServiceRegistry, service: &str) -> Vec<String> {
        registry
            .list(service)
            .await
            .iter()
            .map(|i| i.id.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = ServiceRegistry::new();
        let first = registry.get_or_create("users").await;
        let second = registry.get_or_create("users").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_empty().await);
        assert_eq!(registry.service_count().await, 1);
    }

    #[tokio::test]
    async fn test_add_appends_in_insertion_order() {
        let registry = ServiceRegistry::new();
        registry.add("users", instance("a", "10.0.0.1", 80)).await;
        registry.add("users", instance("b", "10.0.0.2", 80)).await;
        registry.add("users", instance("c", "10.0.0.3", 80)).await;
        assert_eq!(ids(&registry, "users").await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_add_replaces_same_id_in_place() {
        let registry = ServiceRegistry::new();
        registry.add("users", instance("a", "10.0.0.1", 80)).await;
        registry.add("users", instance("b", "10.0.0.2", 80)).await;
        registry.add("users", instance("a", "10.0.0.9", 81)).await;

        let list = registry.list("users").await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "a");
        assert_eq!(list[0].host, "10.0.0.9");
    }

    #[tokio::test]
    async fn test_add_collapses_id_and_address_conflicts() {
        let registry = ServiceRegistry::new();
        registry.add("users", instance("a", "10.0.0.1", 80)).await;
        registry.add("users", instance("b", "10.0.0.2", 80)).await;
        // Shares its id with "a" and its address with "b"
        registry.add("users", instance("a", "10.0.0.2", 80)).await;

        let list = registry.list("users").await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0], instance("a", "10.0.0.2", 80));
    }

    #[tokio::test]
    async fn test_ensure_keys_on_address() {
        let registry = ServiceRegistry::new();
        registry.add("users", instance("a", "10.0.0.1", 80)).await;

        assert!(!registry.ensure("users", instance("other-id", "10.0.0.1", 80)).await);
        assert!(registry.ensure("users", instance("b", "10.0.0.2", 80)).await);
        assert_eq!(ids(&registry, "users").await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_ensure_keeps_shared_ids_at_distinct_addresses() {
        let registry = ServiceRegistry::new();
        assert!(registry.ensure("web", instance("web", "10.0.0.1", 80)).await);
        assert!(registry.ensure("web", instance("web", "10.0.0.2", 80)).await);
        assert!(registry.ensure("web", instance("web", "10.0.0.3", 80)).await);
        assert!(!registry.ensure("web", instance("web", "10.0.0.2", 80)).await);

        let addresses: Vec<String> = registry
            .list("web")
            .await
            .iter()
            .map(|i| i.address())
            .collect();
        assert_eq!(addresses, vec!["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
    }

    #[tokio::test]
    async fn test_ensure_creates_entry() {
        let registry = ServiceRegistry::new();
        assert!(registry.ensure("orders", instance("a", "10.0.0.1", 80)).await);
        assert_eq!(registry.service_names().await, vec!["orders"]);
    }

    #[tokio::test]
    async fn test_remove_at_and_by_id() {
        let registry = ServiceRegistry::new();
        registry.add("users", instance("a", "10.0.0.1", 80)).await;
        registry.add("users", instance("b", "10.0.0.2", 80)).await;
        registry.add("users", instance("c", "10.0.0.3", 80)).await;

        assert_eq!(registry.remove_at("users", 1).await.map(|i| i.id), Some("b".to_string()));
        assert!(registry.remove_at("users", 5).await.is_none());
        assert_eq!(registry.remove("users", "c").await.map(|i| i.id), Some("c".to_string()));
        assert!(registry.remove("users", "missing").await.is_none());
        assert!(registry.remove("unknown", "a").await.is_none());
        assert_eq!(ids(&registry, "users").await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_retain_returns_removed() {
        let registry = ServiceRegistry::new();
        registry.add("users", instance("a", "10.0.0.1", 80)).await;
        registry.add("users", instance("b", "10.0.0.2", 80)).await;

        let removed = registry.retain("users", |i| i.id == "b").await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "a");
        assert_eq!(ids(&registry, "users").await, vec!["b"]);

        // Emptied entries stay tracked
        registry.retain("users", |_| false).await;
        assert!(registry.list("users").await.is_empty());
        assert_eq!(registry.service_count().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_unaffected_by_later_mutation() {
        let registry = ServiceRegistry::new();
        registry.add("users", instance("a", "10.0.0.1", 80)).await;
        let before = registry.list("users").await;
        registry.add("users", instance("b", "10.0.0.2", 80)).await;
        assert_eq!(before.len(), 1);
        assert_eq!(registry.list("users").await.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_adds_keep_identities_unique() {
        let registry = Arc::new(ServiceRegistry::new());
        let mut handles = Vec::new();
        for worker in 0..8u16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..50u16 {
                    let id = format!("i{}", n % 10);
                    let port = 8000 + (n + worker) % 10;
                    registry.add("users", BackendInstance::new(id, "10.0.0.1", port)).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let list = registry.list("users").await;
        for (i, a) in list.iter().enumerate() {
            for b in list.iter().skip(i + 1) {
                assert!(!a.conflicts_with(b), "{:?} conflicts with {:?}", a, b);
            }
        }
    }
}
