//! Discovery-backed and self-checked reconciliation of the service registry
pub mod client;
pub mod error;
pub mod provider;
pub mod reconcile;
pub mod supervisor;

#[cfg(test)]
mod mock;

pub use client::{DiscoveryConfig, HttpDiscoveryClient};
pub use error::{DiscoveryError, Result};
pub use provider::{DiscoveryProvider, HealthRecord, HealthStatus, Registration};
pub use reconcile::{PassReport, Reconciler};
pub use supervisor::{Mode, ReconcileConfig, Signal, Supervisor, SupervisorHandle};
