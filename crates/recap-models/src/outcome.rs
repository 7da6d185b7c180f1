//! Error kinds and terminal outcomes.
//!
//! Every failure in the pipeline is tagged with one of the kinds below
//! before it reaches a caller, so that the API and the progress stream
//! never leak implementation detail.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::blob::BlobHandle;

/// Classification of a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad admission payload; surfaced to the caller.
    InvalidInput,
    /// The user has no minutes left for this request.
    QuotaExceeded,
    /// The user has no active subscription or balance at all.
    PaymentRequired,
    /// A provider failed transiently and retries were exhausted.
    ProviderTransient,
    /// A provider failed permanently; retrying is pointless.
    ProviderPermanent,
    /// A whole stage exceeded its time budget.
    StageTimeout,
    /// The planner could not produce at least one segment.
    PlanUnrealizable,
    /// The stitcher failed after its single retry.
    StitcherFailed,
    /// The job was cancelled; terminal but not an error.
    Cancelled,
    /// Anything else; logged with full context.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::PaymentRequired => "payment_required",
            ErrorKind::ProviderTransient => "provider_transient",
            ErrorKind::ProviderPermanent => "provider_permanent",
            ErrorKind::StageTimeout => "stage_timeout",
            ErrorKind::PlanUnrealizable => "plan_unrealizable",
            ErrorKind::StitcherFailed => "stitcher_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether resubmitting identical input can reasonably succeed.
    pub fn default_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ProviderTransient
                | ErrorKind::StageTimeout
                | ErrorKind::StitcherFailed
                | ErrorKind::Internal
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The user-visible record of why a job ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TerminalError {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Whether the user can resubmit identical input.
    pub retriable: bool,
}

impl TerminalError {
    /// Create a terminal error with the kind's default retriability.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retriable: kind.default_retriable(),
        }
    }
}

/// How a job ended. Applied once by the store; terminal stages never change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TerminalOutcome {
    /// Billing committed; output is available.
    Completed {
        output: BlobHandle,
        output_duration_seconds: f64,
    },
    /// The job failed with a tagged error.
    Failed(TerminalError),
    /// The job was cancelled; the reservation was released.
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_defaults() {
        assert!(ErrorKind::ProviderTransient.default_retriable());
        assert!(ErrorKind::StageTimeout.default_retriable());
        assert!(!ErrorKind::QuotaExceeded.default_retriable());
        assert!(!ErrorKind::PlanUnrealizable.default_retriable());
        assert!(!ErrorKind::Cancelled.default_retriable());
    }

    #[test]
    fn test_terminal_error_serialization() {
        let err = TerminalError::new(ErrorKind::QuotaExceeded, "Not enough minutes");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"quota_exceeded\""));
        assert!(json.contains("\"retriable\":false"));
    }
}
