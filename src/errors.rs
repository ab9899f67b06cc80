//! Error types for policyguard

use alloy_primitives::Address;
use thiserror::Error;

/// Main error type for policyguard operations
///
/// Rule denials are not errors: they come back as
/// [`Decision::Denied`](crate::policy::Decision). Errors here are hard failures
/// the caller must handle explicitly.
#[derive(Error, Debug)]
pub enum PolicyGuardError {
    // Policy configuration errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Reentrant policy call for account {0}")]
    ReentrantCall(Address),

    // Guard errors
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    // Cryptographic errors
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // Storage errors
    #[error("Storage error: {0}")]
    StorageError(String),

    // Service configuration errors
    #[error("Config error: {0}")]
    ConfigError(String),

    // Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for PolicyGuardError {
    fn from(err: std::io::Error) -> Self {
        PolicyGuardError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for PolicyGuardError {
    fn from(err: serde_json::Error) -> Self {
        PolicyGuardError::MalformedInput(format!("JSON error: {}", err))
    }
}

impl From<hex::FromHexError> for PolicyGuardError {
    fn from(err: hex::FromHexError) -> Self {
        PolicyGuardError::MalformedInput(format!("Hex decode error: {}", err))
    }
}

impl PolicyGuardError {
    /// Whether the error was caused by caller-supplied bytes rather than engine state
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            PolicyGuardError::MalformedInput(_)
                | PolicyGuardError::InvalidAddress(_)
                | PolicyGuardError::InvalidSignature(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PolicyGuardError>;
