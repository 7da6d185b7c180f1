//! Engine error types.

use thiserror::Error;

use recap_blob::BlobError;
use recap_gate::GateError;
use recap_models::{ErrorKind, TerminalError};
use recap_store::StoreError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Blob error: {0}")]
    Blob(#[from] BlobError),

    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

    #[error("Plan unrealizable: {0}")]
    Plan(String),

    #[error("Stage {stage} timed out")]
    StageTimeout { stage: &'static str },

    #[error("Stitcher failed: {0}")]
    Stitcher(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Lease lost; another controller owns the job")]
    LeaseLost,

    #[error("Commit unavailable, deferring to recovery: {0}")]
    CommitDeferred(String),

    #[error("Internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn plan(msg: impl Into<String>) -> Self {
        Self::Plan(msg.into())
    }

    pub fn stitcher(msg: impl Into<String>) -> Self {
        Self::Stitcher(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
            || matches!(self, EngineError::Gate(g) if g.is_cancelled())
    }

    /// Classification used for the terminal error record.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            EngineError::Store(StoreError::QuotaExceeded { .. }) => ErrorKind::QuotaExceeded,
            EngineError::Store(_) | EngineError::Blob(_) => ErrorKind::Internal,
            EngineError::Gate(GateError::Exhausted { .. }) => ErrorKind::ProviderTransient,
            EngineError::Gate(GateError::Permanent { .. }) => ErrorKind::ProviderPermanent,
            EngineError::Gate(GateError::Cancelled) => ErrorKind::Cancelled,
            EngineError::Gate(_) => ErrorKind::Internal,
            EngineError::Plan(_) => ErrorKind::PlanUnrealizable,
            EngineError::StageTimeout { .. } => ErrorKind::StageTimeout,
            EngineError::Stitcher(_) => ErrorKind::StitcherFailed,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::LeaseLost
            | EngineError::CommitDeferred(_)
            | EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// User-visible record of this failure.
    pub fn terminal_error(&self) -> TerminalError {
        let kind = self.error_kind();
        let message = match kind {
            ErrorKind::QuotaExceeded => {
                "Not enough minutes left for this video. Top up or wait for your next billing period.".to_string()
            }
            ErrorKind::ProviderTransient => {
                "An external service was temporarily unavailable. Please try again.".to_string()
            }
            ErrorKind::PlanUnrealizable => format!("Could not plan this recap: {}", self),
            ErrorKind::StageTimeout => "Processing took too long and was aborted.".to_string(),
            _ => self.to_string(),
        };
        TerminalError::new(kind, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recap_gate::CallError;

    #[test]
    fn test_quota_error_kind() {
        let err = EngineError::from(StoreError::QuotaExceeded {
            required: 24.0,
            available: 2.0,
        });
        assert_eq!(err.error_kind(), ErrorKind::QuotaExceeded);
        assert!(!err.terminal_error().retriable);
    }

    #[test]
    fn test_gate_exhaustion_is_transient() {
        let err = EngineError::from(GateError::Exhausted {
            provider: "tts".into(),
            attempts: 3,
            source: CallError::transient("blip"),
        });
        assert_eq!(err.error_kind(), ErrorKind::ProviderTransient);
        assert!(err.terminal_error().retriable);
    }

    #[test]
    fn test_cancellation_detection() {
        assert!(EngineError::Cancelled.is_cancelled());
        assert!(EngineError::from(GateError::Cancelled).is_cancelled());
        assert!(!EngineError::plan("too short").is_cancelled());
    }
}
