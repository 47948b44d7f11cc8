//! Error types for zerolink.
//!
//! Framework conditions (lifecycle misuse, unknown services, wire failures) are
//! variants of [`ZerolinkError`]. Failures raised inside a service method never
//! show up here on the server side: they are marshalled into
//! [`RemoteErrorData`](crate::marshal::RemoteErrorData) and come back to the caller
//! as [`ZerolinkError::Remote`].

use crate::marshal::RemoteError;
use thiserror::Error;

/// Main error type for the zerolink framework.
#[derive(Debug, Error)]
pub enum ZerolinkError {
    // Lifecycle errors
    #[error("Container is not running")]
    ContainerNotRunning,

    #[error("Service is not initialized")]
    ServiceNotInitialized,

    #[error("Async call should be in async context")]
    AsyncCallOutsideContext,

    #[error("Async call for method {method} was never called")]
    AsyncCallNeverIssued { method: String },

    #[error("Service {name} is not found")]
    ServiceNotFound { name: String },

    // Remote errors
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Remote error type cannot be resolved: {path}")]
    UnresolvableErrorType { path: String },

    #[error("Event handler for {topic} failed: {message}")]
    EventHandler { topic: String, message: String },

    // Wire errors
    #[error("Transport error at {endpoint}: {message}")]
    Transport {
        endpoint: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Connection closed by {endpoint}")]
    ConnectionClosed { endpoint: String },

    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Malformed envelope: {message}")]
    Envelope { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for zerolink operations.
pub type Result<T> = std::result::Result<T, ZerolinkError>;

impl From<std::io::Error> for ZerolinkError {
    fn from(err: std::io::Error) -> Self {
        ZerolinkError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ZerolinkError {
    fn from(err: serde_json::Error) -> Self {
        ZerolinkError::Serialization {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ZerolinkError {
    /// Create a transport error carrying the endpoint it happened on.
    pub fn transport(
        endpoint: impl std::fmt::Display,
        message: impl Into<String>,
        source: Option<std::io::Error>,
    ) -> Self {
        ZerolinkError::Transport {
            endpoint: endpoint.to_string(),
            message: message.into(),
            source,
        }
    }

    /// Check if this error is worth retrying on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ZerolinkError::Transport { .. }
                | ZerolinkError::ConnectionClosed { .. }
                | ZerolinkError::Io { .. }
        )
    }

    /// The reconstructed remote error, if this is one.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            ZerolinkError::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ZerolinkError::ServiceNotFound {
            name: "billing".into(),
        };
        assert_eq!(err.to_string(), "Service billing is not found");
        assert_eq!(
            ZerolinkError::ContainerNotRunning.to_string(),
            "Container is not running"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ZerolinkError::ConnectionClosed {
            endpoint: "tcp://127.0.0.1:1".into()
        }
        .is_retryable());
        assert!(!ZerolinkError::AsyncCallOutsideContext.is_retryable());
    }

    #[test]
    fn test_io_conversion_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err = ZerolinkError::from(io);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("pipe gone"));
    }
}
