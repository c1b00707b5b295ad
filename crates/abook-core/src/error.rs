//! Error types for the address book bridge
//!
//! This module defines all error types used throughout the crate.
//!
//! ## Failure Classes
//!
//! - **Transient**: `TransportFailure`, `BackendCrashed`. Retried inside the
//!   transport/supervisor pair and never surfaced past the retry budget.
//! - **Terminal**: `PermanentFailure`. The restart budget is exhausted; every
//!   later write is rejected without retry.
//! - **Per-edit**: `WriteRejected`. The local edit is rolled back and the
//!   caller is told the update did not succeed.

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the address book bridge
#[derive(Error, Debug)]
pub enum Error {
    /// Channel broken, no response, or malformed response
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// The backend process failed its liveness probe
    #[error("Backend crashed: {0}")]
    BackendCrashed(String),

    /// The restart budget is exhausted
    #[error("Backend permanently failed: {0}")]
    PermanentFailure(String),

    /// A specific property write failed
    #[error("Write rejected for contact {contact}: {reason}")]
    WriteRejected {
        /// Application contact id (or native id when no app id exists yet)
        contact: String,
        /// Why the write did not go through
        reason: String,
    },

    /// The backend answered a request with `result: error`
    #[error("Request {command} failed: {reason}")]
    RequestFailed {
        /// Command path, e.g. `/props/set`
        command: String,
        /// Reason reported by the backend
        reason: String,
    },

    /// Native store adapter errors
    #[error("Native store error: {0}")]
    NativeStore(String),

    /// Contact cache errors
    #[error("Contact cache error: {0}")]
    ContactCache(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Contact or record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The bridge is shutting down
    #[error("Shutting down")]
    Shutdown,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a transport failure
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportFailure(msg.into())
    }

    /// Create a backend crash error
    pub fn crashed(msg: impl Into<String>) -> Self {
        Self::BackendCrashed(msg.into())
    }

    /// Create a permanent failure error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::PermanentFailure(msg.into())
    }

    /// Create a write rejection
    pub fn write_rejected(contact: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WriteRejected {
            contact: contact.into(),
            reason: reason.into(),
        }
    }

    /// Create a failed-request error
    pub fn request_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RequestFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a native store error
    pub fn native_store(msg: impl Into<String>) -> Self {
        Self::NativeStore(msg.into())
    }

    /// Create a contact cache error
    pub fn contact_cache(msg: impl Into<String>) -> Self {
        Self::ContactCache(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether the failure may clear up after a backend restart
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransportFailure(_) | Self::BackendCrashed(_))
    }

    /// Whether the failure should be shown to the user
    ///
    /// Background reconciliation failures self-correct on the next
    /// notification or full sync and are only logged.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::PermanentFailure(_) | Self::WriteRejected { .. })
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
