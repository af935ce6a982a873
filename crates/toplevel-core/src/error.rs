//! Error types for the worker client.
//!
//! Every caller-facing failure surfaces as a `ClientError` returned from the
//! operation's future. Protocol violations (unknown keys, unknown message
//! types, late responses) never reach callers; they are logged and dropped by
//! the dispatcher.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the worker client.
#[derive(Debug, Error)]
pub enum ClientError {
    // Handshake errors
    #[error("Worker initialization failed: {message}")]
    InitializationFailed { message: String },

    #[error("Worker already initialized")]
    AlreadyInitialized,

    // Operation errors
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Worker error: {message}")]
    Operation { message: String },

    #[error("Correlation key already pending: {key}")]
    KeyInUse { key: String },

    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: &'static str,
    },

    // Channel errors
    #[error("Channel failure: {message}")]
    ChannelFailure { message: String },

    #[error("Worker terminated")]
    Terminated,

    // Configuration errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Wrapped errors
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

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },
}

/// Result type alias for worker client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Network {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ClientError {
    /// Create a channel failure from any displayable cause.
    pub fn channel(message: impl Into<String>) -> Self {
        ClientError::ChannelFailure {
            message: message.into(),
        }
    }

    /// Check if re-issuing the same operation could succeed.
    ///
    /// Timeouts and channel hiccups are scoped to the in-flight requests;
    /// the caller may re-issue with a fresh correlation key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout(_) | ClientError::ChannelFailure { .. }
        )
    }

    /// Check if the client instance is no longer usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::InitializationFailed { .. } | ClientError::Terminated
        )
    }
}
