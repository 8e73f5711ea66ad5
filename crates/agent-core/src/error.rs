//! Error types for the instrument agent.
//!
//! Every failure is recovered at the nearest component boundary and turned into
//! one of these variants. The web layer maps them to HTTP statuses through
//! [`AgentError::status_code`].

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the instrument agent.
#[derive(Debug, Error)]
pub enum AgentError {
    // Lock errors
    #[error("Resource locked by {holder}")]
    Locked { holder: String },

    #[error("Unable to acquire lock {key} after {attempts} attempts")]
    LockAcquisitionFailed { key: String, attempts: u32 },

    // Sniffer errors
    #[error("No passing {service} instance found for {tag}")]
    DiscoveryFailed { service: String, tag: String },

    #[error("Failed to connect to {address}: {message}")]
    DialFailed { address: String, message: String },

    // Driver RPC errors
    #[error("No response in timeout interval {}", .0.as_millis())]
    Timeout(Duration),

    #[error("Invalid parameters: {0:?}")]
    ParameterValidation(BTreeMap<String, String>),

    #[error("Driver not found: {driver_id}")]
    DriverNotFound { driver_id: String },

    #[error("Driver RPC error: {message}")]
    Rpc { message: String },

    // Backend errors
    #[error("Key-value store error: {message}")]
    Store { message: String },

    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Network {
            message: err.to_string(),
            cause: err.url().map(|u| u.to_string()),
        }
    }
}

impl AgentError {
    /// Shorthand for a store failure.
    pub fn store(message: impl Into<String>) -> Self {
        AgentError::Store {
            message: message.into(),
        }
    }

    /// HTTP status code for this error at the web boundary.
    ///
    /// - 400: invalid request or parameter values
    /// - 404: driver not registered
    /// - 408: driver did not answer in time
    /// - 409: resource locked by someone else
    /// - 502: driver or sniffer answered with garbage / could not be reached
    /// - 503: lock or store unavailable
    /// - 500: everything else
    pub fn status_code(&self) -> u16 {
        match self {
            AgentError::Locked { .. } => 409,
            AgentError::LockAcquisitionFailed { .. } | AgentError::Store { .. } => 503,
            AgentError::Timeout(_) => 408,
            AgentError::ParameterValidation(_) | AgentError::Validation { .. } => 400,
            AgentError::DriverNotFound { .. } => 404,
            AgentError::Rpc { .. }
            | AgentError::DiscoveryFailed { .. }
            | AgentError::DialFailed { .. }
            | AgentError::Network { .. } => 502,
            _ => 500,
        }
    }

    /// Check if this error is a transient backend condition.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Network { .. } | AgentError::Timeout(_) | AgentError::Store { .. }
        )
    }
}
