use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the hostplane control plane
#[derive(Debug, Error)]
pub enum HostplaneError {
    // Request validation
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // Lookups
    #[error("Site not found: {0}")]
    SiteNotFound(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Alert not found: {0}")]
    AlertNotFound(String),

    #[error("Custom command not found: {0}")]
    CommandNotFound(String),

    // Allocation
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // Lifecycle
    #[error("{0} is in invalid state for this operation: {1}")]
    InvalidState(String, String),

    #[error("Supervisor error for {0}: {1}")]
    Supervisor(String, String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Partial failure: {0}")]
    PartialFailure(String),

    #[error("Provisioning failed: {0}")]
    Provision(String),

    // State store errors
    #[error("State store error: {0}")]
    StateError(String),

    #[error("Failed to load state: {0}")]
    StateLoadError(String),

    #[error("Failed to save state: {0}")]
    StateSaveError(String),

    #[error("State corruption detected: {0}")]
    StateCorruption(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // IPC-related errors
    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Failed to connect to daemon: {0}")]
    ConnectionError(String),

    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Machine-readable code carried by failure envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    ResourceExhausted,
    SupervisorError,
    Timeout,
    PartialFailure,
    PermissionDenied,
    InvalidState,
    Internal,
}

impl HostplaneError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HostplaneError::Validation(_)
            | HostplaneError::AlreadyExists(_)
            | HostplaneError::ConfigValidationError(_) => ErrorCode::ValidationError,
            HostplaneError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            HostplaneError::SiteNotFound(_)
            | HostplaneError::ServiceNotFound(_)
            | HostplaneError::AlertNotFound(_)
            | HostplaneError::CommandNotFound(_) => ErrorCode::NotFound,
            HostplaneError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            HostplaneError::InvalidState(_, _) => ErrorCode::InvalidState,
            HostplaneError::Supervisor(_, _) | HostplaneError::Provision(_) => {
                ErrorCode::SupervisorError
            }
            HostplaneError::Timeout(_) => ErrorCode::Timeout,
            HostplaneError::PartialFailure(_) => ErrorCode::PartialFailure,
            _ => ErrorCode::Internal,
        }
    }

    /// Message safe to hand back to callers.
    ///
    /// Supervisor and provisioning failures carry OS-level detail that is
    /// logged where it happens; callers only learn which entity failed.
    pub fn public_message(&self) -> String {
        match self {
            HostplaneError::Supervisor(entity, _) => {
                format!("Supervisor operation failed for {}", entity)
            }
            HostplaneError::Provision(_) => "Site provisioning failed".to_string(),
            HostplaneError::StateError(_)
            | HostplaneError::StateLoadError(_)
            | HostplaneError::StateSaveError(_)
            | HostplaneError::StateCorruption(_)
            | HostplaneError::Io(_)
            | HostplaneError::Internal(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for hostplane operations
pub type Result<T> = std::result::Result<T, HostplaneError>;
