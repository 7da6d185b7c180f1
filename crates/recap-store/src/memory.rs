//! In-memory backends for tests and single-process deployments.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use recap_models::{
    Job, JobId, JobLease, JobPatch, JobSnapshot, QuotaAccount, QuotaSnapshot, Segment,
    TerminalOutcome, TopUpCredit, UsageRecord,
};

use crate::error::{StoreError, StoreResult};
use crate::job::{apply_patch, apply_terminal, JobStore};
use crate::ledger::{QuotaLedger, Reservation};

// =============================================================================
// Job store
// =============================================================================

#[derive(Default)]
struct JobStoreInner {
    jobs: HashMap<String, Job>,
    pending: VecDeque<String>,
    segments: HashMap<String, Vec<Segment>>,
}

/// In-memory [`JobStore`].
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<JobStoreInner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lease_for(worker_id: &str, lease_seconds: u64) -> JobLease {
        JobLease {
            worker_id: worker_id.to_string(),
            deadline: Utc::now() + Duration::seconds(lease_seconds as i64),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> StoreResult<JobId> {
        let mut inner = self.inner.write().await;
        let id = job.id.clone();
        if inner.jobs.contains_key(id.as_str()) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        inner.pending.push_back(id.to_string());
        inner.jobs.insert(id.to_string(), job);
        debug!(job_id = %id, "Created job");
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, lease_seconds: u64) -> StoreResult<Option<Job>> {
        let mut inner = self.inner.write().await;
        while let Some(id) = inner.pending.pop_front() {
            let lease = Self::lease_for(worker_id, lease_seconds);
            if let Some(job) = inner.jobs.get_mut(&id) {
                if job.stage.is_terminal() {
                    continue;
                }
                if let Some(existing) = &job.lease {
                    if !existing.is_expired(Utc::now()) {
                        continue;
                    }
                }
                job.lease = Some(lease);
                job.revision += 1;
                job.updated_at = Utc::now();
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    async fn reclaim(
        &self,
        job_id: &JobId,
        worker_id: &str,
        lease_seconds: u64,
    ) -> StoreResult<Option<Job>> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id.as_str())
            .ok_or_else(|| StoreError::not_found(job_id.as_str()))?;

        if job.stage.is_terminal() {
            return Ok(None);
        }
        if let Some(lease) = &job.lease {
            if !lease.is_expired(Utc::now()) {
                return Ok(None);
            }
        }

        job.lease = Some(Self::lease_for(worker_id, lease_seconds));
        job.revision += 1;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn renew_lease(
        &self,
        job_id: &JobId,
        worker_id: &str,
        lease_seconds: u64,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id.as_str())
            .ok_or_else(|| StoreError::not_found(job_id.as_str()))?;

        match &job.lease {
            Some(lease) if lease.worker_id == worker_id => {
                job.lease = Some(Self::lease_for(worker_id, lease_seconds));
                job.revision += 1;
                Ok(())
            }
            _ => Err(StoreError::LeaseLost(job_id.to_string())),
        }
    }

    async fn update(&self, job_id: &JobId, revision: u64, patch: JobPatch) -> StoreResult<Job> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id.as_str())
            .ok_or_else(|| StoreError::not_found(job_id.as_str()))?;

        if job.stage.is_terminal() {
            return Err(StoreError::TerminalJob(job_id.to_string()));
        }
        if job.revision != revision {
            return Err(StoreError::RevisionConflict {
                job_id: job_id.to_string(),
                expected: revision,
            });
        }

        apply_patch(job, &patch);
        job.revision += 1;
        Ok(job.clone())
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Job> {
        let inner = self.inner.read().await;
        inner
            .jobs
            .get(job_id.as_str())
            .cloned()
            .ok_or_else(|| StoreError::not_found(job_id.as_str()))
    }

    async fn get_snapshot(&self, job_id: &JobId) -> StoreResult<JobSnapshot> {
        Ok(self.get(job_id).await?.snapshot())
    }

    async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<JobSnapshot>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<JobSnapshot> = inner
            .jobs
            .values()
            .filter(|j| j.owner_id == owner_id)
            .map(Job::snapshot)
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn mark_terminal(&self, job_id: &JobId, outcome: TerminalOutcome) -> StoreResult<Job> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id.as_str())
            .ok_or_else(|| StoreError::not_found(job_id.as_str()))?;

        if apply_terminal(job, &outcome) {
            job.revision += 1;
        }
        Ok(job.clone())
    }

    async fn request_cancel(&self, job_id: &JobId) -> StoreResult<JobSnapshot> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id.as_str())
            .ok_or_else(|| StoreError::not_found(job_id.as_str()))?;

        match job.stage {
            s if !s.is_terminal() => {
                if !job.cancel_requested {
                    job.cancel_requested = true;
                    job.revision += 1;
                    job.updated_at = Utc::now();
                }
                Ok(job.snapshot())
            }
            recap_models::JobStage::Cancelled => Ok(job.snapshot()),
            _ => Err(StoreError::TerminalJob(job_id.to_string())),
        }
    }

    async fn list_pending_for_recovery(&self) -> StoreResult<Vec<Job>> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        Ok(inner
            .jobs
            .values()
            .filter(|j| {
                !j.stage.is_terminal()
                    && j.lease.as_ref().is_some_and(|lease| lease.is_expired(now))
            })
            .cloned()
            .collect())
    }

    async fn put_segments(&self, job_id: &JobId, segments: &[Segment]) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.jobs.contains_key(job_id.as_str()) {
            return Err(StoreError::not_found(job_id.as_str()));
        }
        inner.segments.insert(job_id.to_string(), segments.to_vec());
        Ok(())
    }

    async fn get_segments(&self, job_id: &JobId) -> StoreResult<Vec<Segment>> {
        let inner = self.inner.read().await;
        let mut segments = inner
            .segments
            .get(job_id.as_str())
            .cloned()
            .unwrap_or_default();
        segments.sort_by_key(|s| s.index);
        Ok(segments)
    }

    async fn update_segment(&self, segment: &Segment) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let segments = inner
            .segments
            .get_mut(segment.job_id.as_str())
            .ok_or_else(|| StoreError::not_found(segment.job_id.as_str()))?;
        let slot = segments
            .iter_mut()
            .find(|s| s.index == segment.index)
            .ok_or_else(|| {
                StoreError::internal(format!(
                    "segment {} not planned for job {}",
                    segment.index, segment.job_id
                ))
            })?;
        *slot = segment.clone();
        Ok(())
    }
}

// =============================================================================
// Quota ledger
// =============================================================================

#[derive(Default)]
struct LedgerInner {
    accounts: HashMap<String, QuotaAccount>,
    reservations: HashMap<String, Reservation>,
    reservations_by_key: HashMap<String, String>,
    usage: HashMap<String, UsageRecord>,
}

fn usage_key(job_id: &JobId, billing_period: &str) -> String {
    format!("{}:{}", job_id, billing_period)
}

/// In-memory [`QuotaLedger`]. A single mutex serializes all operations,
/// which trivially satisfies the per-user serialization requirement.
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<LedgerInner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaLedger for MemoryLedger {
    async fn ensure_account(
        &self,
        user_id: &str,
        subscription_minutes_limit: f64,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| QuotaAccount::new(user_id, subscription_minutes_limit));
        Ok(())
    }

    async fn snapshot(&self, user_id: &str) -> StoreResult<QuotaSnapshot> {
        let inner = self.inner.lock().await;
        let account = inner
            .accounts
            .get(user_id)
            .ok_or_else(|| StoreError::AccountNotFound(user_id.to_string()))?;
        let mut view = account.clone();
        view.roll_period(&recap_models::current_billing_period());
        Ok(view.snapshot())
    }

    async fn reserve(
        &self,
        user_id: &str,
        estimate_minutes: f64,
        reservation_key: &str,
    ) -> StoreResult<String> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.reservations_by_key.get(reservation_key) {
            return Ok(existing.clone());
        }

        let period = recap_models::current_billing_period();
        let account = inner
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| StoreError::AccountNotFound(user_id.to_string()))?;
        account.roll_period(&period);

        let available = account.available_minutes();
        if available < estimate_minutes {
            return Err(StoreError::QuotaExceeded {
                required: estimate_minutes,
                available,
            });
        }

        account.reserved_minutes += estimate_minutes;
        account.updated_at = Utc::now();

        let reservation = Reservation::new(reservation_key, user_id, estimate_minutes);
        let id = reservation.id.clone();
        inner
            .reservations_by_key
            .insert(reservation_key.to_string(), id.clone());
        inner.reservations.insert(id.clone(), reservation);
        debug!(user_id, estimate_minutes, reservation_id = %id, "Reserved minutes");
        Ok(id)
    }

    async fn commit(
        &self,
        reservation_id: &str,
        actual_minutes: f64,
        job_id: &JobId,
        billing_period: &str,
    ) -> StoreResult<UsageRecord> {
        let mut inner = self.inner.lock().await;
        let key = usage_key(job_id, billing_period);

        // Exactly-once: an existing usage record makes this a no-op.
        if let Some(existing) = inner.usage.get(&key).cloned() {
            if let Some(reservation) = inner.reservations.remove(reservation_id) {
                inner.reservations_by_key.remove(&reservation.key);
                if let Some(account) = inner.accounts.get_mut(&reservation.user_id) {
                    account.reserved_minutes =
                        (account.reserved_minutes - reservation.minutes).max(0.0);
                }
            }
            return Ok(existing);
        }

        let reservation = inner
            .reservations
            .remove(reservation_id)
            .ok_or_else(|| StoreError::ReservationNotFound(reservation_id.to_string()))?;
        inner.reservations_by_key.remove(&reservation.key);

        let account = inner
            .accounts
            .get_mut(&reservation.user_id)
            .ok_or_else(|| StoreError::AccountNotFound(reservation.user_id.clone()))?;
        account.roll_period(billing_period);
        account.reserved_minutes = (account.reserved_minutes - reservation.minutes).max(0.0);
        // Bill what was actually deducted: an exhausted account can never
        // accumulate more billed minutes than it ever held.
        let deducted = account.deduct(actual_minutes);
        account.updated_at = Utc::now();

        let record = UsageRecord {
            job_id: job_id.clone(),
            user_id: reservation.user_id.clone(),
            billing_period: billing_period.to_string(),
            minutes_billed: deducted,
            created_at: Utc::now(),
        };
        inner.usage.insert(key, record.clone());
        debug!(job_id = %job_id, minutes_billed = deducted, "Committed usage");
        Ok(record)
    }

    async fn release(&self, reservation_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(reservation) = inner.reservations.remove(reservation_id) {
            inner.reservations_by_key.remove(&reservation.key);
            if let Some(account) = inner.accounts.get_mut(&reservation.user_id) {
                account.reserved_minutes =
                    (account.reserved_minutes - reservation.minutes).max(0.0);
                account.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn top_up(
        &self,
        user_id: &str,
        minutes: f64,
        external_reference: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let account = inner
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| StoreError::AccountNotFound(user_id.to_string()))?;

        if account
            .top_ups
            .iter()
            .any(|t| t.external_reference == external_reference)
        {
            return Ok(());
        }

        account.top_ups.push(TopUpCredit {
            purchased_minutes: minutes,
            remaining_minutes: minutes,
            created_at: Utc::now(),
            external_reference: external_reference.to_string(),
        });
        account.updated_at = Utc::now();
        Ok(())
    }

    async fn usage_for(
        &self,
        job_id: &JobId,
        billing_period: &str,
    ) -> StoreResult<Option<UsageRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.usage.get(&usage_key(job_id, billing_period)).cloned())
    }
}
