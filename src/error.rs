//! Error types for the SATA device plugin
//!
//! Provides structured error types for device discovery, the plugin
//! lifecycle, registration with the kubelet, and allocation.

use thiserror::Error;

/// Failure to enumerate block devices on the host
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Failed to run discovery command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Discovery command `{command}` exited with {status}, output: {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    #[error("Discovery output is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Discovery output has no `{key}` key")]
    MissingKey { key: String },
}

/// Unified error type for the plugin
#[derive(Error, Debug)]
#[allow(clippy::result_large_err)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Discovery Errors
    // =========================================================================
    #[error("Device discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    // =========================================================================
    // Plugin Lifecycle Errors
    // =========================================================================
    #[error("Failed to build device plugin: {0}")]
    Build(#[source] DiscoveryError),

    #[error("Failed to start device plugin on {socket}: {reason}")]
    Start { socket: String, reason: String },

    #[error("Failed to register with kubelet at {endpoint}: {reason}")]
    Register { endpoint: String, reason: String },

    #[error("Cannot {operation} a plugin in state {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::plugin::PluginState,
    },

    // =========================================================================
    // Allocation Errors
    // =========================================================================
    #[error("Allocation failed: requested {requested} devices, only {available} discovered")]
    Allocation { requested: usize, available: usize },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    // =========================================================================
    // Supervisor Errors
    // =========================================================================
    #[error("Filesystem watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the supervisor or RPC layer does with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Terminate the process
    Fatal,
    /// Keep the restart pending and run Start + Register again
    RetryRegistration,
    /// Return the failure to the RPC caller, keep serving
    ReportToCaller,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // The kubelet may simply not be up yet
            Error::Register { .. } => ErrorAction::RetryRegistration,

            // Failures scoped to a single RPC
            Error::Allocation { .. } | Error::Grpc(_) | Error::InvalidState { .. } => {
                ErrorAction::ReportToCaller
            }

            // A host that cannot enumerate or serve its own devices has no recovery
            Error::Discovery(_)
            | Error::Build(_)
            | Error::Start { .. }
            | Error::Configuration(_) => ErrorAction::Fatal,

            _ => ErrorAction::Fatal,
        }
    }

    /// Check if this error terminates the process
    pub fn is_fatal(&self) -> bool {
        matches!(self.action(), ErrorAction::Fatal)
    }

    /// Check if the supervisor retries after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryRegistration)
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Allocation { .. } | Error::InvalidState { .. } => {
                tonic::Status::failed_precondition(err.to_string())
            }
            Error::Discovery(_) | Error::Build(_) => tonic::Status::unavailable(err.to_string()),
            Error::Configuration(msg) => tonic::Status::invalid_argument(msg),
            Error::Grpc(status) => status,
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

/// Result type alias for the plugin
pub type Result<T> = std::result::Result<T, Error>;
