//! Error types for the Flow orchestrator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Rejected input: bad cardinality, missing mandatory attribute,
    /// dependency cycle. Never touches service state.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A concurrent operation is already in flight (e.g. a role is scaling)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Compute or network layer call failed; retried on the next tick
    #[error("Infrastructure error: {0}")]
    TransientInfra(String),

    /// A VM reached an unrecoverable state
    #[error("Deployment failure: {0}")]
    DeploymentFailure(String),

    #[error("Invalid state: service is {current}, expected {expected}")]
    InvalidState { current: String, expected: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(u64),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Role not found: {0}")]
    RoleNotFound(String),

    #[error("VM not found: {0}")]
    VmNotFound(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the reconciliation loop should retry the failed call
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientInfra(_))
    }

    /// Whether this error is returned to the caller without touching state
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::Conflict(_) | Error::InvalidState { .. }
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn invalid_state(current: impl ToString, expected: impl Into<String>) -> Self {
        Error::InvalidState {
            current: current.to_string(),
            expected: expected.into(),
        }
    }
}
