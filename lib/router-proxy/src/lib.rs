//! Request dispatch for the gateway: backend selection, admission control,
//! health probing and HTTP forwarding
pub mod admission;
pub mod dispatch;
pub mod forwarder;
pub mod health_check;
pub mod http;
pub mod load_balancer;
pub mod metrics;

pub use admission::{AdmissionConfig, AdmissionError, AdmissionLimiter, AdmissionWindow};
pub use dispatch::Dispatcher;
pub use forwarder::RequestForwarder;
pub use health_check::{HealthCheckConfig, HealthChecker};
pub use http::HttpProxy;
pub use load_balancer::{LoadBalancer, LoadBalancingStrategy};
pub use metrics::MetricsCollector;
