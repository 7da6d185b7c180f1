//! Redis-backed job store and quota ledger.
//!
//! Jobs live in a hash per id (`payload` JSON + `revision` counter) with a
//! Lua compare-and-set guarding every write; pending ids sit in a list.
//! Quota accounts use the same hash-plus-revision shape: every ledger
//! operation is a load, an in-memory mutation, and a single Lua script
//! that re-checks the revision and lands all of its writes (deduction,
//! usage record, reservation bookkeeping) in one atomic step. Concurrent
//! writers, including other server processes, lose the compare-and-set
//! and retry against fresh state.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use redis::AsyncCommands;
use tracing::{debug, warn};

use recap_models::{
    Job, JobId, JobLease, JobPatch, JobSnapshot, QuotaAccount, QuotaSnapshot, Segment,
    TerminalOutcome, TopUpCredit, UsageRecord,
};

use crate::error::{StoreError, StoreResult};
use crate::job::{apply_patch, apply_terminal, JobStore};
use crate::ledger::{QuotaLedger, Reservation};

/// Maximum retries for compare-and-set loops before giving up.
const MAX_CAS_RETRIES: u32 = 5;

/// Compare-and-set on the job hash: replace the payload only if the
/// stored revision matches the expected one.
const JOB_CAS_SCRIPT: &str = r#"
local rev = redis.call('HGET', KEYS[1], 'revision')
if rev == ARGV[1] then
  redis.call('HSET', KEYS[1], 'payload', ARGV[2], 'revision', ARGV[3])
  return 1
end
return 0
"#;

/// Create the account hash only if absent.
/// KEYS: account. ARGV: payload.
const ACCOUNT_INIT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  redis.call('HSET', KEYS[1], 'payload', ARGV[1], 'revision', 0)
  return 1
end
return 0
"#;

/// Compare-and-set on the account hash.
/// KEYS: account. ARGV: expected revision, payload, new revision.
const ACCOUNT_CAS_SCRIPT: &str = r#"
local rev = redis.call('HGET', KEYS[1], 'revision')
if rev == ARGV[1] then
  redis.call('HSET', KEYS[1], 'payload', ARGV[2], 'revision', ARGV[3])
  return 1
end
return 0
"#;

/// Hold minutes and record the reservation in one step.
/// KEYS: account, reservation, reservation key index.
/// ARGV: expected revision, account payload, new revision,
///       reservation payload, reservation id.
const RESERVE_SCRIPT: &str = r#"
local rev = redis.call('HGET', KEYS[1], 'revision')
if rev ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'payload', ARGV[2], 'revision', ARGV[3])
redis.call('SET', KEYS[2], ARGV[4])
redis.call('SET', KEYS[3], ARGV[5])
return 1
"#;

/// Return a hold and drop the reservation in one step.
/// KEYS: account, reservation, reservation key index.
/// ARGV: expected revision, account payload, new revision.
const RELEASE_SCRIPT: &str = r#"
local rev = redis.call('HGET', KEYS[1], 'revision')
if rev ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'payload', ARGV[2], 'revision', ARGV[3])
redis.call('DEL', KEYS[2])
redis.call('DEL', KEYS[3])
return 1
"#;

/// Insert the usage record, apply the deduction and drop the reservation
/// in one atomic step. The record insert is the exactly-once anchor:
/// returns 1 when it was inserted (deducted payload stored), 2 when it
/// already existed (only the hold is released, no deduction).
/// KEYS: account, usage record, reservation, reservation key index.
/// ARGV: expected revision, deducted payload, hold-released payload,
///       new revision, usage record payload.
const COMMIT_SCRIPT: &str = r#"
local rev = redis.call('HGET', KEYS[1], 'revision')
if rev ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[3])
redis.call('DEL', KEYS[4])
if redis.call('SET', KEYS[2], ARGV[5], 'NX') then
  redis.call('HSET', KEYS[1], 'payload', ARGV[2], 'revision', ARGV[4])
  return 1
end
redis.call('HSET', KEYS[1], 'payload', ARGV[3], 'revision', ARGV[4])
return 2
"#;

/// Configuration for the Redis backend.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis URL
    pub url: String,
    /// Key prefix for all engine state
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "recap".to_string(),
        }
    }
}

impl RedisStoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: std::env::var("REDIS_KEY_PREFIX").unwrap_or_else(|_| "recap".to_string()),
        }
    }
}

// =============================================================================
// Job store
// =============================================================================

/// Redis-backed [`JobStore`].
pub struct RedisJobStore {
    client: redis::Client,
    prefix: String,
    cas: redis::Script,
}

impl RedisJobStore {
    pub fn new(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            prefix: config.key_prefix,
            cas: redis::Script::new(JOB_CAS_SCRIPT),
        })
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    fn pending_key(&self) -> String {
        format!("{}:jobs:pending", self.prefix)
    }

    fn index_key(&self) -> String {
        format!("{}:jobs:index", self.prefix)
    }

    fn owner_key(&self, owner_id: &str) -> String {
        format!("{}:jobs:owner:{}", self.prefix, owner_id)
    }

    fn segments_key(&self, job_id: &str) -> String {
        format!("{}:segments:{}", self.prefix, job_id)
    }

    async fn conn(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn load(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job_id: &str,
    ) -> StoreResult<Job> {
        let payload: Option<String> = conn.hget(self.job_key(job_id), "payload").await?;
        let payload = payload.ok_or_else(|| StoreError::not_found(job_id))?;
        Ok(serde_json::from_str(&payload)?)
    }

    /// Store the job payload if its revision is still `expected`.
    async fn cas_write(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job: &Job,
        expected: u64,
    ) -> StoreResult<bool> {
        let payload = serde_json::to_string(job)?;
        let applied: i32 = self
            .cas
            .key(self.job_key(job.id.as_str()))
            .arg(expected)
            .arg(payload)
            .arg(job.revision)
            .invoke_async(conn)
            .await?;
        Ok(applied == 1)
    }

    /// Load-mutate-CAS loop for callers that do not hold a revision.
    async fn modify<F>(&self, job_id: &JobId, mut mutate: F) -> StoreResult<Job>
    where
        F: FnMut(&mut Job) -> StoreResult<bool>,
    {
        let mut conn = self.conn().await?;

        for attempt in 0..MAX_CAS_RETRIES {
            let mut job = self.load(&mut conn, job_id.as_str()).await?;
            let expected = job.revision;

            if !mutate(&mut job)? {
                return Ok(job);
            }

            job.revision = expected + 1;
            if self.cas_write(&mut conn, &job, expected).await? {
                return Ok(job);
            }
            debug!(job_id = %job_id, attempt = attempt + 1, "Job CAS contention, retrying");
        }

        Err(StoreError::RevisionConflict {
            job_id: job_id.to_string(),
            expected: 0,
        })
    }

    fn lease_for(worker_id: &str, lease_seconds: u64) -> JobLease {
        JobLease {
            worker_id: worker_id.to_string(),
            deadline: Utc::now() + Duration::seconds(lease_seconds as i64),
        }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, job: Job) -> StoreResult<JobId> {
        let mut conn = self.conn().await?;
        let id = job.id.clone();
        let key = self.job_key(id.as_str());

        let exists: bool = conn.exists(&key).await?;
        if exists {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }

        let payload = serde_json::to_string(&job)?;
        let _: () = redis::pipe()
            .hset(&key, "payload", payload)
            .hset(&key, "revision", job.revision)
            .sadd(self.index_key(), id.as_str())
            .sadd(self.owner_key(&job.owner_id), id.as_str())
            .lpush(self.pending_key(), id.as_str())
            .query_async(&mut conn)
            .await?;

        debug!(job_id = %id, "Created job");
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, lease_seconds: u64) -> StoreResult<Option<Job>> {
        let mut conn = self.conn().await?;

        loop {
            let id: Option<String> = conn.rpop(self.pending_key(), None).await?;
            let Some(id) = id else {
                return Ok(None);
            };

            let job_id = JobId::from_string(&id);
            let claimed = self
                .modify(&job_id, |job| {
                    if job.stage.is_terminal() {
                        return Ok(false);
                    }
                    if let Some(lease) = &job.lease {
                        if !lease.is_expired(Utc::now()) {
                            return Ok(false);
                        }
                    }
                    job.lease = Some(Self::lease_for(worker_id, lease_seconds));
                    job.updated_at = Utc::now();
                    Ok(true)
                })
                .await;

            match claimed {
                Ok(job) if job.lease.as_ref().is_some_and(|l| l.worker_id == worker_id) => {
                    return Ok(Some(job));
                }
                Ok(_) => continue,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn reclaim(
        &self,
        job_id: &JobId,
        worker_id: &str,
        lease_seconds: u64,
    ) -> StoreResult<Option<Job>> {
        let mut reclaimed = false;
        let job = self
            .modify(job_id, |job| {
                reclaimed = false;
                if job.stage.is_terminal() {
                    return Ok(false);
                }
                if let Some(lease) = &job.lease {
                    if !lease.is_expired(Utc::now()) {
                        return Ok(false);
                    }
                }
                job.lease = Some(Self::lease_for(worker_id, lease_seconds));
                job.updated_at = Utc::now();
                reclaimed = true;
                Ok(true)
            })
            .await?;
        Ok(reclaimed.then_some(job))
    }

    async fn renew_lease(
        &self,
        job_id: &JobId,
        worker_id: &str,
        lease_seconds: u64,
    ) -> StoreResult<()> {
        let mut owned = false;
        self.modify(job_id, |job| {
            owned = job
                .lease
                .as_ref()
                .is_some_and(|l| l.worker_id == worker_id);
            if !owned || job.stage.is_terminal() {
                return Ok(false);
            }
            job.lease = Some(Self::lease_for(worker_id, lease_seconds));
            Ok(true)
        })
        .await?;

        if owned {
            Ok(())
        } else {
            Err(StoreError::LeaseLost(job_id.to_string()))
        }
    }

    async fn update(&self, job_id: &JobId, revision: u64, patch: JobPatch) -> StoreResult<Job> {
        let mut conn = self.conn().await?;
        let mut job = self.load(&mut conn, job_id.as_str()).await?;

        if job.stage.is_terminal() {
            return Err(StoreError::TerminalJob(job_id.to_string()));
        }
        if job.revision != revision {
            return Err(StoreError::RevisionConflict {
                job_id: job_id.to_string(),
                expected: revision,
            });
        }

        apply_patch(&mut job, &patch);
        job.revision = revision + 1;

        if self.cas_write(&mut conn, &job, revision).await? {
            Ok(job)
        } else {
            Err(StoreError::RevisionConflict {
                job_id: job_id.to_string(),
                expected: revision,
            })
        }
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Job> {
        let mut conn = self.conn().await?;
        self.load(&mut conn, job_id.as_str()).await
    }

    async fn get_snapshot(&self, job_id: &JobId) -> StoreResult<JobSnapshot> {
        Ok(self.get(job_id).await?.snapshot())
    }

    async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<JobSnapshot>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(self.owner_key(owner_id)).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&mut conn, &id).await {
                Ok(job) => jobs.push(job.snapshot()),
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn mark_terminal(&self, job_id: &JobId, outcome: TerminalOutcome) -> StoreResult<Job> {
        self.modify(job_id, |job| Ok(apply_terminal(job, &outcome)))
            .await
    }

    async fn request_cancel(&self, job_id: &JobId) -> StoreResult<JobSnapshot> {
        let mut terminal_conflict = false;
        let job = self
            .modify(job_id, |job| {
                terminal_conflict = false;
                if job.stage.is_terminal() {
                    terminal_conflict = job.stage != recap_models::JobStage::Cancelled;
                    return Ok(false);
                }
                if job.cancel_requested {
                    return Ok(false);
                }
                job.cancel_requested = true;
                job.updated_at = Utc::now();
                Ok(true)
            })
            .await?;

        if terminal_conflict {
            return Err(StoreError::TerminalJob(job_id.to_string()));
        }
        Ok(job.snapshot())
    }

    async fn list_pending_for_recovery(&self) -> StoreResult<Vec<Job>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(self.index_key()).await?;
        let now = Utc::now();

        let mut recoverable = Vec::new();
        for id in ids {
            match self.load(&mut conn, &id).await {
                Ok(job)
                    if !job.stage.is_terminal()
                        && job.lease.as_ref().is_some_and(|l| l.is_expired(now)) =>
                {
                    recoverable.push(job);
                }
                Ok(_) => {}
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(recoverable)
    }

    async fn put_segments(&self, job_id: &JobId, segments: &[Segment]) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let key = self.segments_key(job_id.as_str());

        let mut pipe = redis::pipe();
        pipe.del(&key);
        for segment in segments {
            pipe.hset(&key, segment.index, serde_json::to_string(segment)?);
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_segments(&self, job_id: &JobId) -> StoreResult<Vec<Segment>> {
        let mut conn = self.conn().await?;
        let raw: HashMap<u32, String> = conn.hgetall(self.segments_key(job_id.as_str())).await?;

        let mut segments = Vec::with_capacity(raw.len());
        for payload in raw.values() {
            segments.push(serde_json::from_str::<Segment>(payload)?);
        }
        segments.sort_by_key(|s| s.index);
        Ok(segments)
    }

    async fn update_segment(&self, segment: &Segment) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let key = self.segments_key(segment.job_id.as_str());
        let _: () = conn
            .hset(&key, segment.index, serde_json::to_string(segment)?)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Quota ledger
// =============================================================================

/// Redis-backed [`QuotaLedger`].
///
/// Accounts are a hash (`payload` JSON + `revision`) mutated only through
/// Lua scripts that compare-and-set the revision and land every write of
/// an operation atomically; the commit script couples the `SET NX` usage
/// record, the deduction and the reservation cleanup so no crash window
/// can leak a hold or double-bill. Contention (including from other
/// processes) retries against fresh state, up to [`MAX_CAS_RETRIES`].
pub struct RedisLedger {
    client: redis::Client,
    prefix: String,
    init: redis::Script,
    cas: redis::Script,
    reserve_script: redis::Script,
    release_script: redis::Script,
    commit_script: redis::Script,
}

impl RedisLedger {
    pub fn new(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            prefix: config.key_prefix,
            init: redis::Script::new(ACCOUNT_INIT_SCRIPT),
            cas: redis::Script::new(ACCOUNT_CAS_SCRIPT),
            reserve_script: redis::Script::new(RESERVE_SCRIPT),
            release_script: redis::Script::new(RELEASE_SCRIPT),
            commit_script: redis::Script::new(COMMIT_SCRIPT),
        })
    }

    fn account_key(&self, user_id: &str) -> String {
        format!("{}:quota:{}", self.prefix, user_id)
    }

    fn reservation_key(&self, id: &str) -> String {
        format!("{}:resv:{}", self.prefix, id)
    }

    fn reservation_by_key_key(&self, key: &str) -> String {
        format!("{}:resvkey:{}", self.prefix, key)
    }

    fn usage_record_key(&self, job_id: &JobId, period: &str) -> String {
        format!("{}:usage:{}:{}", self.prefix, job_id, period)
    }

    async fn conn(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn load_account(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        user_id: &str,
    ) -> StoreResult<(QuotaAccount, u64)> {
        let (payload, revision): (Option<String>, Option<u64>) = redis::pipe()
            .hget(self.account_key(user_id), "payload")
            .hget(self.account_key(user_id), "revision")
            .query_async(conn)
            .await?;
        let payload = payload.ok_or_else(|| StoreError::AccountNotFound(user_id.to_string()))?;
        Ok((serde_json::from_str(&payload)?, revision.unwrap_or(0)))
    }
}

#[async_trait]
impl QuotaLedger for RedisLedger {
    async fn ensure_account(
        &self,
        user_id: &str,
        subscription_minutes_limit: f64,
    ) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let account = QuotaAccount::new(user_id, subscription_minutes_limit);
        // Existing accounts are untouched.
        let _: i32 = self
            .init
            .key(self.account_key(user_id))
            .arg(serde_json::to_string(&account)?)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn snapshot(&self, user_id: &str) -> StoreResult<QuotaSnapshot> {
        let mut conn = self.conn().await?;
        let (mut account, _) = self.load_account(&mut conn, user_id).await?;
        account.roll_period(&recap_models::current_billing_period());
        Ok(account.snapshot())
    }

    async fn reserve(
        &self,
        user_id: &str,
        estimate_minutes: f64,
        reservation_key: &str,
    ) -> StoreResult<String> {
        let mut conn = self.conn().await?;

        for attempt in 0..MAX_CAS_RETRIES {
            let existing: Option<String> = conn
                .get(self.reservation_by_key_key(reservation_key))
                .await?;
            if let Some(id) = existing {
                return Ok(id);
            }

            let (mut account, revision) = self.load_account(&mut conn, user_id).await?;
            account.roll_period(&recap_models::current_billing_period());

            let available = account.available_minutes();
            if available < estimate_minutes {
                return Err(StoreError::QuotaExceeded {
                    required: estimate_minutes,
                    available,
                });
            }

            let reservation = Reservation::new(reservation_key, user_id, estimate_minutes);
            account.reserved_minutes += estimate_minutes;
            account.updated_at = Utc::now();

            let applied: i32 = self
                .reserve_script
                .key(self.account_key(user_id))
                .key(self.reservation_key(&reservation.id))
                .key(self.reservation_by_key_key(reservation_key))
                .arg(revision)
                .arg(serde_json::to_string(&account)?)
                .arg(revision + 1)
                .arg(serde_json::to_string(&reservation)?)
                .arg(reservation.id.as_str())
                .invoke_async(&mut conn)
                .await?;
            if applied == 1 {
                debug!(user_id, estimate_minutes, reservation_id = %reservation.id, "Reserved minutes");
                return Ok(reservation.id);
            }
            debug!(user_id, attempt = attempt + 1, "Account CAS contention on reserve, retrying");
        }

        Err(StoreError::internal(
            "reserve failed due to concurrent account updates",
        ))
    }

    async fn commit(
        &self,
        reservation_id: &str,
        actual_minutes: f64,
        job_id: &JobId,
        billing_period: &str,
    ) -> StoreResult<UsageRecord> {
        let mut conn = self.conn().await?;

        let reservation: Option<String> = conn.get(self.reservation_key(reservation_id)).await?;
        let reservation: Option<Reservation> = match reservation {
            Some(payload) => Some(serde_json::from_str(&payload)?),
            None => None,
        };

        let Some(reservation) = reservation else {
            // Retried commit after a prior success: the record is the anchor.
            let existing: Option<String> =
                conn.get(self.usage_record_key(job_id, billing_period)).await?;
            return match existing {
                Some(payload) => Ok(serde_json::from_str(&payload)?),
                None => Err(StoreError::ReservationNotFound(reservation_id.to_string())),
            };
        };

        for attempt in 0..MAX_CAS_RETRIES {
            let (mut account, revision) =
                self.load_account(&mut conn, &reservation.user_id).await?;
            account.roll_period(billing_period);
            account.reserved_minutes =
                (account.reserved_minutes - reservation.minutes).max(0.0);
            account.updated_at = Utc::now();

            // Bill what would actually be deducted: an exhausted account
            // can never accumulate more billed minutes than it ever held.
            let mut charged = account.clone();
            let deducted = charged.deduct(actual_minutes);
            let record = UsageRecord {
                job_id: job_id.clone(),
                user_id: reservation.user_id.clone(),
                billing_period: billing_period.to_string(),
                minutes_billed: deducted,
                created_at: Utc::now(),
            };

            let outcome: i32 = self
                .commit_script
                .key(self.account_key(&reservation.user_id))
                .key(self.usage_record_key(job_id, billing_period))
                .key(self.reservation_key(&reservation.id))
                .key(self.reservation_by_key_key(&reservation.key))
                .arg(revision)
                .arg(serde_json::to_string(&charged)?)
                .arg(serde_json::to_string(&account)?)
                .arg(revision + 1)
                .arg(serde_json::to_string(&record)?)
                .invoke_async(&mut conn)
                .await?;

            match outcome {
                1 => {
                    debug!(job_id = %job_id, minutes_billed = deducted, "Committed usage");
                    return Ok(record);
                }
                2 => {
                    warn!(job_id = %job_id, "Commit observed an existing usage record; no deduction");
                    let existing: Option<String> = conn
                        .get(self.usage_record_key(job_id, billing_period))
                        .await?;
                    return match existing {
                        Some(payload) => Ok(serde_json::from_str(&payload)?),
                        None => Ok(record),
                    };
                }
                _ => {
                    debug!(job_id = %job_id, attempt = attempt + 1, "Account CAS contention on commit, retrying");
                }
            }
        }

        Err(StoreError::internal(
            "commit failed due to concurrent account updates",
        ))
    }

    async fn release(&self, reservation_id: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.get(self.reservation_key(reservation_id)).await?;
        let Some(payload) = payload else {
            return Ok(());
        };
        let reservation: Reservation = serde_json::from_str(&payload)?;

        for attempt in 0..MAX_CAS_RETRIES {
            let (mut account, revision) =
                self.load_account(&mut conn, &reservation.user_id).await?;
            account.reserved_minutes =
                (account.reserved_minutes - reservation.minutes).max(0.0);
            account.updated_at = Utc::now();

            let applied: i32 = self
                .release_script
                .key(self.account_key(&reservation.user_id))
                .key(self.reservation_key(&reservation.id))
                .key(self.reservation_by_key_key(&reservation.key))
                .arg(revision)
                .arg(serde_json::to_string(&account)?)
                .arg(revision + 1)
                .invoke_async(&mut conn)
                .await?;
            if applied == 1 {
                return Ok(());
            }
            debug!(
                user_id = %reservation.user_id,
                attempt = attempt + 1,
                "Account CAS contention on release, retrying"
            );
        }

        Err(StoreError::internal(
            "release failed due to concurrent account updates",
        ))
    }

    async fn top_up(
        &self,
        user_id: &str,
        minutes: f64,
        external_reference: &str,
    ) -> StoreResult<()> {
        let mut conn = self.conn().await?;

        for attempt in 0..MAX_CAS_RETRIES {
            let (mut account, revision) = self.load_account(&mut conn, user_id).await?;
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

            let applied: i32 = self
                .cas
                .key(self.account_key(user_id))
                .arg(revision)
                .arg(serde_json::to_string(&account)?)
                .arg(revision + 1)
                .invoke_async(&mut conn)
                .await?;
            if applied == 1 {
                return Ok(());
            }
            debug!(user_id, attempt = attempt + 1, "Account CAS contention on top-up, retrying");
        }

        Err(StoreError::internal(
            "top-up failed due to concurrent account updates",
        ))
    }

    async fn usage_for(
        &self,
        job_id: &JobId,
        billing_period: &str,
    ) -> StoreResult<Option<UsageRecord>> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.get(self.usage_record_key(job_id, billing_period)).await?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recap_models::{BlobHandle, JobConfig};

    fn test_config() -> RedisStoreConfig {
        RedisStoreConfig {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: format!("recap-test-{}", uuid::Uuid::new_v4()),
        }
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_redis_create_claim_update() {
        let store = RedisJobStore::new(test_config()).unwrap();
        let job = Job::new(
            "user-1",
            BlobHandle::new("media", "s.mp4"),
            600.0,
            JobConfig::default(),
        );
        let id = store.create(job).await.unwrap();

        let claimed = store.claim("w1", 60).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);

        let updated = store
            .update(&id, claimed.revision, JobPatch::new().with_progress(5.0))
            .await
            .unwrap();
        assert_eq!(updated.progress, 5.0);

        let stale = store
            .update(&id, claimed.revision, JobPatch::new().with_progress(6.0))
            .await;
        assert!(matches!(stale, Err(StoreError::RevisionConflict { .. })));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_redis_commit_exactly_once() {
        let ledger = RedisLedger::new(test_config()).unwrap();
        ledger.ensure_account("user-1", 60.0).await.unwrap();

        let job_id = JobId::from_string("j1");
        let resv = ledger.reserve("user-1", 24.0, "resv:j1").await.unwrap();
        ledger.commit(&resv, 6.0, &job_id, "2026-08").await.unwrap();
        ledger.commit(&resv, 6.0, &job_id, "2026-08").await.unwrap();

        let snap = ledger.snapshot("user-1").await.unwrap();
        assert_eq!(snap.subscription_minutes_used, 6.0);
        // The hold was returned atomically with the commit.
        assert_eq!(snap.total_available_minutes, 54.0);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_redis_release_returns_hold() {
        let ledger = RedisLedger::new(test_config()).unwrap();
        ledger.ensure_account("user-1", 60.0).await.unwrap();

        let resv = ledger.reserve("user-1", 24.0, "resv:j1").await.unwrap();
        let held = ledger.snapshot("user-1").await.unwrap();
        assert_eq!(held.total_available_minutes, 36.0);

        ledger.release(&resv).await.unwrap();
        let snap = ledger.snapshot("user-1").await.unwrap();
        assert_eq!(snap.total_available_minutes, 60.0);
    }
}
