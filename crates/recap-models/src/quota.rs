//! Quota accounts, top-up credits and usage records.

use chrono::{DateTime, Datelike, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Get the current billing period key in "YYYY-MM" format.
///
/// Jobs bill into the calendar month in which they complete; the
/// `(job_id, billing_period)` pair anchors exactly-once billing.
pub fn current_billing_period() -> String {
    let now = Utc::now();
    format!("{:04}-{:02}", now.year(), now.month())
}

/// A pool of minutes purchased outside the subscription.
///
/// Top-ups roll over across billing periods and are consumed
/// oldest-first, only after subscription minutes are exhausted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TopUpCredit {
    /// Minutes originally purchased
    pub purchased_minutes: f64,
    /// Minutes still available
    pub remaining_minutes: f64,
    /// Purchase time; ordering key for oldest-first consumption
    pub created_at: DateTime<Utc>,
    /// Payment-provider reference; idempotency key for the purchase
    pub external_reference: String,
}

/// Per-user quota state, mutated only through the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QuotaAccount {
    pub user_id: String,
    /// Subscription minutes granted per billing period
    pub subscription_minutes_limit: f64,
    /// Subscription minutes consumed this period
    pub subscription_minutes_used: f64,
    /// Minutes held by outstanding reservations
    #[serde(default)]
    pub reserved_minutes: f64,
    /// Period the `subscription_minutes_used` counter belongs to
    pub usage_period: String,
    /// Rollover credits, oldest first
    #[serde(default)]
    pub top_ups: Vec<TopUpCredit>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaAccount {
    /// Create a fresh account for the current period.
    pub fn new(user_id: impl Into<String>, subscription_minutes_limit: f64) -> Self {
        Self {
            user_id: user_id.into(),
            subscription_minutes_limit,
            subscription_minutes_used: 0.0,
            reserved_minutes: 0.0,
            usage_period: current_billing_period(),
            top_ups: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Reset the monthly usage counter when the billing period has rolled.
    /// Top-ups are untouched; they roll over.
    pub fn roll_period(&mut self, period: &str) {
        if self.usage_period != period {
            self.usage_period = period.to_string();
            self.subscription_minutes_used = 0.0;
        }
    }

    /// Remaining minutes across all top-up credits.
    pub fn top_up_minutes_remaining(&self) -> f64 {
        self.top_ups.iter().map(|t| t.remaining_minutes).sum()
    }

    /// Minutes available for a new reservation.
    pub fn available_minutes(&self) -> f64 {
        let subscription_left =
            (self.subscription_minutes_limit - self.subscription_minutes_used).max(0.0);
        (subscription_left + self.top_up_minutes_remaining() - self.reserved_minutes).max(0.0)
    }

    /// Deduct billed minutes: subscription first, then top-ups oldest-first.
    ///
    /// Returns the number of minutes actually deducted, which can be
    /// less than requested if the account is exhausted.
    pub fn deduct(&mut self, minutes: f64) -> f64 {
        let mut remaining = minutes;

        let subscription_left =
            (self.subscription_minutes_limit - self.subscription_minutes_used).max(0.0);
        let from_subscription = remaining.min(subscription_left);
        self.subscription_minutes_used += from_subscription;
        remaining -= from_subscription;

        self.top_ups
            .sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for credit in &mut self.top_ups {
            if remaining <= 0.0 {
                break;
            }
            let take = remaining.min(credit.remaining_minutes);
            credit.remaining_minutes -= take;
            remaining -= take;
        }

        minutes - remaining
    }

    /// Public snapshot of the account.
    pub fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            subscription_minutes_limit: self.subscription_minutes_limit,
            subscription_minutes_used: self.subscription_minutes_used,
            top_up_minutes_remaining: self.top_up_minutes_remaining(),
            total_available_minutes: self.available_minutes(),
            billing_period: self.usage_period.clone(),
        }
    }
}

/// User-facing quota summary.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QuotaSnapshot {
    pub subscription_minutes_limit: f64,
    pub subscription_minutes_used: f64,
    pub top_up_minutes_remaining: f64,
    pub total_available_minutes: f64,
    pub billing_period: String,
}

/// One row per `(job, billing period)`; the exactly-once anchor.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UsageRecord {
    pub job_id: JobId,
    pub user_id: String,
    pub billing_period: String,
    pub minutes_billed: f64,
    pub created_at: DateTime<Utc>,
}

/// Completion notice emitted to the billing sink.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BillingNotice {
    pub job_id: JobId,
    pub user_id: String,
    pub billed_minutes: f64,
    pub billing_period: String,
}
