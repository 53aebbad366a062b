//! Error handling module for the image builder
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Configuration problems surface from `Builder::prepare`; everything that happens
//! during a run is captured as a `BuilderError` value in the state bag.

use thiserror::Error;

use crate::api::ApiError;
use crate::config::ConfigError;

/// Main error type for the image builder
#[derive(Error, Debug, Clone)]
pub enum BuilderError {
    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Remote provisioning API errors
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// A step failed during forward execution
    #[error("Step '{step}' failed: {message}")]
    Step { step: &'static str, message: String },

    /// A rollback action failed (reported, never escalated)
    #[error("Cleanup of step '{step}' failed: {message}")]
    Cleanup { step: &'static str, message: String },

    /// The run was cancelled by an external request
    #[error("Build was cancelled")]
    Cancelled,

    /// State errors (missing state bag entries, invalid builder usage)
    #[error("State error: {0}")]
    State(String),

    /// IO errors (hook commands, config files)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(String),
}

/// Result type alias for builder operations
pub type Result<T> = std::result::Result<T, BuilderError>;

impl BuilderError {
    /// Create a step execution error
    pub fn step(step: &'static str, msg: impl Into<String>) -> Self {
        Self::Step {
            step,
            message: msg.into(),
        }
    }

    /// Create a cleanup error
    pub fn cleanup(step: &'static str, msg: impl Into<String>) -> Self {
        Self::Cleanup {
            step,
            message: msg.into(),
        }
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Returns true if this error represents a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Api(ApiError::Cancelled))
    }
}

impl From<std::io::Error> for BuilderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BuilderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BuilderError::step("create_login_key", "quota exceeded");
        assert_eq!(
            err.to_string(),
            "Step 'create_login_key' failed: quota exceeded"
        );

        let err = BuilderError::state("missing server instance");
        assert_eq!(err.to_string(), "State error: missing server instance");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BuilderError = io_err.into();
        assert!(matches!(err, BuilderError::Io(_)));
    }

    #[test]
    fn test_cancellation_classification() {
        assert!(BuilderError::Cancelled.is_cancelled());
        assert!(BuilderError::Api(ApiError::Cancelled).is_cancelled());
        assert!(!BuilderError::cleanup("delete_public_ip", "gone").is_cancelled());
    }
}
