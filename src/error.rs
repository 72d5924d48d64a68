//! Error types for the Spark advisory engine
//!
//! Structured error definitions via thiserror. The public hook entry points
//! never propagate these to the host; they are caught at the engine boundary
//! and logged.

use thiserror::Error;

/// Main error type for advisory operations
#[derive(Error, Debug)]
pub enum SparkError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Packet failed save-time validation
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Packet not found in store or index
    #[error("Packet not found: {0}")]
    PacketNotFound(String),

    /// LLM provider request failed
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider call exceeded its timeout
    #[error("Provider timed out after {0} ms")]
    ProviderTimeout(u64),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not acquire the tuneables write lock in time
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for advisory operations
pub type Result<T> = std::result::Result<T, SparkError>;

impl From<anyhow::Error> for SparkError {
    fn from(err: anyhow::Error) -> Self {
        SparkError::Other(err.to_string())
    }
}
