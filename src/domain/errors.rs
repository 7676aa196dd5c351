use thiserror::Error;

use crate::config::ConfigError;

/// Failures that abort a whole operation (enqueue, batch, prune, migrate).
///
/// Per-message delivery errors are not listed here: they are recorded on the
/// row and never leave the dispatcher.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid input: {0}")]
    Input(String),
    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),
    #[error("transport connection failure: {0:#}")]
    TransportConnection(anyhow::Error),
}

impl RelayError {
    /// Whether the failure should surface as a non-zero exit for batch runs.
    pub fn is_transport_connection(&self) -> bool {
        matches!(self, RelayError::TransportConnection(_))
    }
}
