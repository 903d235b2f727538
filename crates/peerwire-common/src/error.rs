//! Error types for Peerwire
//!
//! Metering never fails the I/O it wraps; these errors cover configuration,
//! identifier parsing and the edges of the sidecar binary.

use thiserror::Error;

use crate::types::node_id::NodeIdError;

/// Result type alias using PeerwireError
pub type Result<T> = std::result::Result<T, PeerwireError>;

/// Unified error type for Peerwire operations
#[derive(Debug, Error)]
pub enum PeerwireError {
    // Identifier errors
    #[error("Invalid node id: {0}")]
    InvalidNodeId(#[from] NodeIdError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for PeerwireError {
    fn from(err: serde_json::Error) -> Self {
        PeerwireError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for PeerwireError {
    fn from(err: anyhow::Error) -> Self {
        PeerwireError::Internal(err.to_string())
    }
}
