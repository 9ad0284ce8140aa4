//! Core routing and service registry functionality
//!
//! This library provides:
//! - Backend instance model shared by every gateway component
//! - Service registry holding the live per-service instance lists
//! - Core error type used by selection and administration paths

pub mod registry;
pub mod endpoint;
pub mod error;

pub use registry::{ServiceEntry, ServiceRegistry};
pub use endpoint::BackendInstance;
pub use error::{CoreError, Result};
