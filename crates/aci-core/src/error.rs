//! Error types for the ACI client layer.
//!
//! Wire-originated variants carry the operation name and the remote endpoint
//! (`node <id> at host:port` or `local kernel at host:port`) so a failure can be
//! traced back to the exchange that produced it.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the ACI client layer.
#[derive(Debug, Error)]
pub enum AciError {
    // Reference errors
    #[error("Malformed service reference: {reference:?}")]
    MalformedReference { reference: String },

    // Transport errors
    #[error("Transport failure during {op} with {endpoint}: {message}")]
    Transport {
        op: String,
        endpoint: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Read timeout after {timeout:?} during {op} with {endpoint}")]
    Timeout {
        op: String,
        endpoint: String,
        timeout: Duration,
    },

    #[error("Authentication with {endpoint} failed: {message}")]
    AuthenticationFailed { endpoint: String, message: String },

    #[error("Could not resolve the location of node {node_id}: {message}")]
    ResolutionFailed { node_id: String, message: String },

    // Protocol errors
    #[error("Protocol violation during {op} with {endpoint}: expected {expected:?}, received {received:?}")]
    ProtocolViolation {
        op: String,
        endpoint: String,
        expected: String,
        received: String,
    },

    #[error("Remote {op} failed on {endpoint}: {message}")]
    Remote {
        op: String,
        endpoint: String,
        message: String,
    },

    // Service location errors
    #[error("Service instance {instance_id} is no longer reachable on node {node_id}: {message}")]
    StaleLocation {
        instance_id: String,
        node_id: String,
        message: String,
    },

    #[error("Invocation of {method} on {instance_id} returned an empty or corrupt result envelope")]
    EmptyOrCorruptResult { instance_id: String, method: String },

    #[error("Invalid resource query type {code} for service {service}")]
    InvalidQuery { code: i32, service: String },

    // Payload errors
    #[error("Envelope error: {message}")]
    Envelope { message: String },

    #[error("Codec error: {message}")]
    Codec {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Local errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Result type alias for ACI operations.
pub type Result<T> = std::result::Result<T, AciError>;

impl From<serde_json::Error> for AciError {
    fn from(err: serde_json::Error) -> Self {
        AciError::Codec {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Peer error texts that mean the target instance is not (or no longer) hosted there.
const STALE_MARKERS: [&str; 4] = ["404", "410", "not found", "gone"];

impl AciError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        AciError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Failures recovered by a forced reconnect and a single retry.
    pub fn is_transport(&self) -> bool {
        matches!(self, AciError::Transport { .. } | AciError::Timeout { .. })
    }

    /// Application-level failures that mean the cached location is out of date.
    pub fn is_stale_location(&self) -> bool {
        match self {
            AciError::StaleLocation { .. } => true,
            AciError::Remote { message, .. } => {
                let lowered = message.to_ascii_lowercase();
                STALE_MARKERS.iter().any(|marker| lowered.contains(marker))
            }
            _ => false,
        }
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        self.is_transport() || self.is_stale_location()
    }
}
