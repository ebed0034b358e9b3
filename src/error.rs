//! Error types for vpnctl

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VpnError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Command execution failed
    #[error("Command '{cmd}' failed{}: {stderr}", .code.map(|c| format!(" with code {}", c)).unwrap_or_default())]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },

    /// The orchestrator sent a structurally incomplete request
    #[error("Required {resource} attribute {attr} is missing")]
    Implementation { resource: String, attr: String },

    /// A value is present but not supported by the backend
    #[error("{resource} attribute {key} with value '{value}' is not supported")]
    Validation { resource: String, key: String, value: String },

    /// A remote resource could not be created
    #[error("Failed to create {resource} ({which})")]
    ResourceCreate { resource: String, which: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Service error (keying daemon, appliance session)
    #[error("Service error: {0}")]
    ServiceError(String),

    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// HTTP transport error (connection refused, timeout, TLS)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Orchestrator RPC failure
    #[error("RPC error: {0}")]
    Rpc(String),
}

impl VpnError {
    pub fn implementation(resource: impl Into<String>, attr: impl Into<String>) -> Self {
        VpnError::Implementation { resource: resource.into(), attr: attr.into() }
    }

    pub fn validation(
        resource: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        VpnError::Validation { resource: resource.into(), key: key.into(), value: value.into() }
    }

    /// Returns `true` for contract violations by the orchestrator.
    pub fn is_implementation(&self) -> bool {
        matches!(self, VpnError::Implementation { .. })
    }

    /// Returns `true` for unsupported-but-present values.
    pub fn is_validation(&self) -> bool {
        matches!(self, VpnError::Validation { .. })
    }
}

impl From<serde_json::Error> for VpnError {
    fn from(error: serde_json::Error) -> Self {
        VpnError::ParseError(error.to_string())
    }
}

pub type VpnResult<T> = Result<T, VpnError>;
