//! Tunnel client errors

use outray_proto::ProtoError;
use thiserror::Error;

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ProtoError),

    #[error("Local service error: {0}")]
    LocalServiceError(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    #[error("Tunnel closed")]
    Closed,
}

impl TunnelError {
    /// Returns true if this error is non-recoverable and retrying won't help
    pub fn is_non_recoverable(&self) -> bool {
        matches!(self, TunnelError::ConfigError(_))
    }

    /// Returns true if this error is recoverable and retrying might succeed
    pub fn is_recoverable(&self) -> bool {
        !self.is_non_recoverable()
    }

    /// Errors that end the current control connection and trigger a reconnect
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            TunnelError::ConnectionError(_) | TunnelError::TransportError(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TunnelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TunnelError::TransportError(err.to_string())
    }
}
