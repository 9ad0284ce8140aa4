use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Failures talking to the discovery provider
///
/// These never reach request callers; the supervisor turns them into
/// mode-switch signals.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("Invalid discovery configuration: {0}")]
    Config(String),

    #[error("Discovery request failed: {0}")]
    Request(String),

    #[error("Discovery responded with status {status}: {body}")]
    Response { status: u16, body: String },

    #[error("Discovery response could not be decoded: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            DiscoveryError::Decode(err.to_string())
        } else {
            DiscoveryError::Request(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        DiscoveryError::Decode(err.to_string())
    }
}
