//! Provider and relay error taxonomy.

use thiserror::Error;

/// Errors raised by a provider adapter. Upstream HTTP and decoding errors are
/// normalized into these variants at the adapter boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Malformed conversation, model or budget, or rejected as such upstream.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The upstream could not be reached or refused the credentials.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The upstream failed after the stream had started.
    #[error("Stream interrupted: {reason}")]
    Interrupted { partial: String, reason: String },
}

/// Errors surfaced by the stream relay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Raised only after streaming began; `partial` is what the caller already got.
    #[error("Stream interrupted after {fragments} fragment(s): {reason}")]
    StreamInterrupted {
        partial: String,
        fragments: usize,
        reason: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl RelayError {
    /// Text already delivered to the caller, for interrupted streams.
    pub fn partial(&self) -> Option<&str> {
        match self {
            RelayError::StreamInterrupted { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

impl From<ProviderError> for RelayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidRequest(msg) => RelayError::InvalidRequest(msg),
            ProviderError::Unavailable(msg) => RelayError::ProviderUnavailable(msg),
            ProviderError::Interrupted { partial, reason } => RelayError::StreamInterrupted {
                partial,
                fragments: 0,
                reason,
            },
        }
    }
}

impl From<chatrelay_core::Error> for RelayError {
    fn from(err: chatrelay_core::Error) -> Self {
        use chatrelay_core::Error;
        match err {
            Error::NotFound(what) => RelayError::SessionNotFound(what),
            Error::InvalidInput(msg) => RelayError::InvalidRequest(msg),
            other => RelayError::Storage(other.to_string()),
        }
    }
}
