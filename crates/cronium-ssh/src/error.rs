//! Error types for cronium-ssh.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for cronium-ssh operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while talking to remote hosts.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Dial or liveness failure. Never retried internally.
    #[error("host unreachable ({key}): {reason}")]
    Unreachable {
        /// Connection key (`user@host:port`)
        key: String,
        /// Underlying cause
        reason: String,
    },

    /// Too many recent dial failures for this key.
    #[error("host unreachable ({0}): circuit open after repeated connection failures")]
    CircuitOpen(String),

    /// The server rejected every offered credential.
    #[error("authentication failed for {key}: {reason}")]
    Auth {
        /// Connection key (`user@host:port`)
        key: String,
        /// Underlying cause
        reason: String,
    },

    /// Protocol or channel error from the SSH transport.
    #[error("SSH error: {0}")]
    Ssh(String),

    /// An operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// No pooled target and no direct session were supplied.
    #[error("no SSH session available")]
    NoSession,

    /// Script language is not one the engine can materialize.
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// The HTTP request descriptor could not be translated.
    #[error("invalid HTTP request: {0}")]
    InvalidHttpRequest(String),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error from the external variable store.
    #[error("variable store error: {0}")]
    VariableStore(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for EngineError {
    fn from(err: russh::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}

impl EngineError {
    /// Whether the error describes a deadline being hit.
    ///
    /// Errors bubbling up from the transport only carry text, so this also
    /// looks for a timeout marker in the message.
    pub fn is_timeout(&self) -> bool {
        if matches!(self, Self::Timeout(_)) {
            return true;
        }
        let message = self.to_string().to_lowercase();
        message.contains("timed out") || message.contains("timeout")
    }
}
