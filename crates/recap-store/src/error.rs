//! Store error types.

use thiserror::Error;

/// Result type for store and ledger operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the job store or quota ledger.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Revision conflict on job {job_id}: expected {expected}")]
    RevisionConflict { job_id: String, expected: u64 },

    #[error("Lease lost for job {0}")]
    LeaseLost(String),

    #[error("Job {0} is terminal and cannot be updated")]
    TerminalJob(String),

    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    #[error("Quota exceeded: required {required} minutes, {available} available")]
    QuotaExceeded { required: f64, available: f64 },

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller should re-read and retry the operation.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::RevisionConflict { .. })
    }
}
