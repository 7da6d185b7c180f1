//! Quota ledger trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use recap_models::{JobId, QuotaSnapshot, UsageRecord};

use crate::error::StoreResult;

/// An intent-to-bill marker held from job admission to commit.
///
/// Reservations hold their estimate against the account's availability so
/// concurrent jobs cannot oversubscribe a user's minutes. They are
/// released without deduction when a job fails or is cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation ID handed back to the controller
    pub id: String,
    /// Idempotency key, derived from the job ID
    pub key: String,
    /// Account the minutes are held against
    pub user_id: String,
    /// Estimated minutes held
    pub minutes: f64,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(key: impl Into<String>, user_id: impl Into<String>, minutes: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            key: key.into(),
            user_id: user_id.into(),
            minutes,
            created_at: Utc::now(),
        }
    }
}

/// Per-user minutes accounting with exactly-once billing.
///
/// The ledger is the sole mutator of quota accounts and usage records;
/// implementations serialize operations per user. The uniqueness of the
/// `(job_id, billing_period)` usage record makes `commit` a no-op on
/// retry: a commit that observes an existing record returns it and
/// performs no deduction.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Create the account if absent; existing accounts are untouched.
    async fn ensure_account(
        &self,
        user_id: &str,
        subscription_minutes_limit: f64,
    ) -> StoreResult<()>;

    /// Current quota summary for the user, with the billing period rolled
    /// to the present month.
    async fn snapshot(&self, user_id: &str) -> StoreResult<QuotaSnapshot>;

    /// Hold `estimate_minutes` against the account. Fails with
    /// `QuotaExceeded` when availability is short. Idempotent by
    /// `reservation_key`: a repeat call returns the existing reservation ID
    /// without holding additional minutes.
    async fn reserve(
        &self,
        user_id: &str,
        estimate_minutes: f64,
        reservation_key: &str,
    ) -> StoreResult<String>;

    /// Deduct `actual_minutes` (subscription first, then top-ups
    /// oldest-first) and insert the usage record in the same atomic step.
    /// Exactly-once by `(job_id, billing_period)`.
    async fn commit(
        &self,
        reservation_id: &str,
        actual_minutes: f64,
        job_id: &JobId,
        billing_period: &str,
    ) -> StoreResult<UsageRecord>;

    /// Drop a reservation without deducting. A no-op for unknown IDs.
    async fn release(&self, reservation_id: &str) -> StoreResult<()>;

    /// Add purchased minutes. Idempotent by `external_reference`.
    async fn top_up(
        &self,
        user_id: &str,
        minutes: f64,
        external_reference: &str,
    ) -> StoreResult<()>;

    /// Look up the usage record for a job in a period, if any.
    async fn usage_for(
        &self,
        job_id: &JobId,
        billing_period: &str,
    ) -> StoreResult<Option<UsageRecord>>;
}

/// Reservation key for a job; stable across crash recovery.
pub fn reservation_key_for(job_id: &JobId) -> String {
    format!("resv:{}", job_id)
}
