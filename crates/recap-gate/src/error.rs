//! Gate error types.

use thiserror::Error;

/// Result type for gated calls.
pub type GateResult<T> = Result<T, GateError>;

/// How a single provider attempt failed, as reported by the caller's
/// operation. The gate decides whether each classification retries.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// Worth retrying: network blips, 5xx-style conditions, timeouts.
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying is pointless: bad input, unsupported media, auth.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Provider returned a status code; retriability is decided by the
    /// provider's `retriable_statuses` config.
    #[error("status {code}: {message}")]
    Status { code: u16, message: String },
}

impl CallError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }
}

/// Final outcome of a gated call.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider {provider} failed after {attempts} attempts: {source}")]
    Exhausted {
        provider: String,
        attempts: u32,
        source: CallError,
    },

    #[error("Provider {provider} failed permanently: {source}")]
    Permanent {
        provider: String,
        source: CallError,
    },

    #[error("Call cancelled")]
    Cancelled,

    #[error("Gate internal error: {0}")]
    Internal(String),
}

impl GateError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GateError::Cancelled)
    }

    /// Whether resubmitting the whole job could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, GateError::Exhausted { .. })
    }
}
