use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("No backend available for service: {0}")]
    NoBackendAvailable(String),

    #[error("Instance not found: {service}/{id}")]
    InstanceNotFound { service: String, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
