//! Pipeline controller: the per-job state machine.
//!
//! Claims pending jobs from the store, drives each through
//! Reserving -> Ingesting -> Planning -> SegmentProcessing -> Stitching ->
//! Committing, renews its lease along the way, and recovers jobs whose
//! lease expired in another (crashed) instance. A job is never marked
//! `Completed` until the ledger commit has returned success.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use recap_models::{
    current_billing_period, BillingNotice, Job, JobId, JobPatch, JobSnapshot, JobStage,
    ProgressEvent, TerminalOutcome, UsageRecord,
};
use recap_blob::BlobStore;
use recap_store::ledger::reservation_key_for;
use recap_store::{JobStore, QuotaLedger, StoreError};

use crate::billing::{sign_notice, BillingSink as _};
use crate::config::EngineConfig;
use crate::context::{EngineDeps, JobHandle};
use crate::error::{EngineError, EngineResult};
use crate::planner::{plan_segments, PlanContext};
use crate::pool::{blob_call_error, process_segments};
use crate::providers::{provider_ids, ChapterProvider as _, TranscodeOutput};
use crate::stitcher::stitch;

/// Resume point for a claimed job. Committing resumes at Stitching:
/// output metadata is only persisted at the terminal write, and the
/// stable assembly plan makes a re-stitch idempotent.
fn resume_rank(stage: JobStage) -> u8 {
    match stage {
        JobStage::Pending | JobStage::Reserving => 1,
        JobStage::Ingesting => 2,
        JobStage::Planning => 3,
        JobStage::SegmentProcessing => 4,
        JobStage::Stitching | JobStage::Committing => 5,
        JobStage::Completed | JobStage::Failed | JobStage::Cancelled => u8::MAX,
    }
}

/// The job state machine driver.
pub struct PipelineController {
    deps: Arc<EngineDeps>,
    config: EngineConfig,
    worker_id: String,
    shutdown: watch::Sender<bool>,
    job_semaphore: Arc<Semaphore>,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl PipelineController {
    pub fn new(deps: Arc<EngineDeps>, config: EngineConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Self {
            deps,
            config,
            worker_id: format!("controller-{}", Uuid::new_v4()),
            shutdown,
            job_semaphore,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Signal shutdown; in-flight jobs get a grace period in [`run`].
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Cancel a job: flags the durable record and trips the in-process
    /// cancellation token if we are driving it. Idempotent.
    pub async fn cancel(&self, job_id: &JobId) -> EngineResult<JobSnapshot> {
        let snapshot = self.deps.store.request_cancel(job_id).await?;
        if let Some(token) = self
            .active
            .lock()
            .expect("active jobs lock poisoned")
            .get(job_id.as_str())
        {
            token.cancel();
        }
        info!(job_id = %job_id, "Cancellation requested");
        Ok(snapshot)
    }

    /// Main loop: recovery sweeps plus claim-and-drive until shutdown.
    pub async fn run(self: Arc<Self>) -> EngineResult<()> {
        info!(
            worker_id = %self.worker_id,
            max_jobs = self.config.max_concurrent_jobs,
            "Starting pipeline controller"
        );

        // Recovery sweep: reclaim jobs whose lease expired. Runs once at
        // startup, then periodically.
        let controller = Arc::clone(&self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let recovery_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(controller.config.recovery_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = Self::recovery_sweep(&controller).await {
                            warn!(error = %e, "Recovery sweep failed");
                        }
                    }
                }
            }
        });

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if self.job_semaphore.available_permits() == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            let claimed = tokio::select! {
                _ = shutdown_rx.changed() => continue,
                claimed = self
                    .deps
                    .store
                    .claim(&self.worker_id, self.config.lease_seconds) => claimed,
            };

            match claimed {
                Ok(Some(job)) => Self::spawn_job(&self, job).await,
                Ok(None) => tokio::time::sleep(self.config.claim_poll_interval).await,
                Err(e) => {
                    error!(error = %e, "Failed to claim a job");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }

        recovery_task.abort();

        info!("Waiting for in-flight jobs to finish...");
        let _ = tokio::time::timeout(Duration::from_secs(60), self.wait_for_jobs()).await;
        info!("Pipeline controller stopped");
        Ok(())
    }

    async fn wait_for_jobs(&self) {
        loop {
            if self.job_semaphore.available_permits() == self.config.max_concurrent_jobs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn spawn_job(this: &Arc<Self>, job: Job) {
        let Ok(permit) = Arc::clone(&this.job_semaphore).acquire_owned().await else {
            return;
        };
        let controller = Arc::clone(this);
        tokio::spawn(async move {
            let _permit = permit;
            controller.drive_job(job).await;
        });
    }

    /// Reclaim and resume jobs whose lease expired while non-terminal.
    async fn recovery_sweep(this: &Arc<Self>) -> EngineResult<()> {
        let expired = this.deps.store.list_pending_for_recovery().await?;
        for job in expired {
            let already_ours = this
                .active
                .lock()
                .expect("active jobs lock poisoned")
                .contains_key(job.id.as_str());
            if already_ours {
                continue;
            }
            if this.job_semaphore.available_permits() == 0 {
                break;
            }

            match this
                .deps
                .store
                .reclaim(&job.id, &this.worker_id, this.config.lease_seconds)
                .await
            {
                Ok(Some(reclaimed)) => {
                    info!(job_id = %reclaimed.id, stage = %reclaimed.stage, "Recovered job");
                    Self::spawn_job(this, reclaimed).await;
                }
                Ok(None) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to reclaim job"),
            }
        }
        Ok(())
    }

    /// Drive one claimed job to a terminal state (or hand it back to
    /// recovery if the lease is lost or the commit must be deferred).
    async fn drive_job(&self, job: Job) {
        let job_id = job.id.clone();
        let cancel = CancellationToken::new();
        if job.cancel_requested {
            cancel.cancel();
        }
        self.active
            .lock()
            .expect("active jobs lock poisoned")
            .insert(job_id.to_string(), cancel.clone());

        let handle = JobHandle::new(Arc::clone(&self.deps), job);
        let lease_lost = Arc::new(AtomicBool::new(false));

        // Lease heartbeat at a third of the lease duration.
        let heartbeat = {
            let deps = Arc::clone(&self.deps);
            let worker_id = self.worker_id.clone();
            let job_id = job_id.clone();
            let lease_seconds = self.config.lease_seconds;
            let lease_lost = Arc::clone(&lease_lost);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let period = Duration::from_secs((lease_seconds / 3).max(1));
                loop {
                    tokio::time::sleep(period).await;
                    match deps.store.renew_lease(&job_id, &worker_id, lease_seconds).await {
                        Ok(()) => {}
                        Err(StoreError::LeaseLost(_)) => {
                            warn!(job_id = %job_id, "Lease lost; abandoning job");
                            lease_lost.store(true, Ordering::SeqCst);
                            cancel.cancel();
                            break;
                        }
                        Err(e) => warn!(job_id = %job_id, error = %e, "Lease renewal failed"),
                    }
                }
            })
        };

        let result = self.run_stages(&handle, &cancel).await;
        heartbeat.abort();

        if lease_lost.load(Ordering::SeqCst) {
            // Another controller instance owns the job now; writing a
            // terminal outcome here would race its progress.
            warn!(job_id = %job_id, "Job abandoned after lease loss");
        } else {
            match result {
                Ok(()) => info!(job_id = %job_id, "Job completed"),
                Err(EngineError::CommitDeferred(reason)) => {
                    // Stays in Committing; the recovery sweep retries the
                    // commit after the lease expires.
                    warn!(job_id = %job_id, reason = %reason, "Commit deferred to recovery");
                }
                Err(e) if e.is_cancelled() => self.finalize_cancelled(&handle).await,
                Err(e) => self.finalize_failed(&handle, &e).await,
            }
        }

        self.active
            .lock()
            .expect("active jobs lock poisoned")
            .remove(job_id.as_str());
    }

    async fn run_stages(
        &self,
        handle: &JobHandle,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let job = handle.job().await;
        let rank = resume_rank(job.stage);
        if rank == u8::MAX {
            return Ok(());
        }
        if rank > 1 {
            info!(job_id = %job.id, stage = %job.stage, "Resuming job");
        }

        if rank <= 1 {
            self.check_cancel(handle, cancel).await?;
            self.enter_stage(handle, JobStage::Reserving, "Reserving minutes...").await?;
            self.stage_reserve(handle).await?;
        }
        if rank <= 2 {
            self.check_cancel(handle, cancel).await?;
            self.enter_stage(handle, JobStage::Ingesting, "Checking source media...").await?;
            self.stage_ingest(handle, cancel).await?;
        }
        if rank <= 3 {
            self.check_cancel(handle, cancel).await?;
            self.enter_stage(handle, JobStage::Planning, "Planning segments...").await?;
            self.stage_plan(handle, cancel).await?;
        }
        if rank <= 4 {
            self.check_cancel(handle, cancel).await?;
            self.enter_stage(handle, JobStage::SegmentProcessing, "Narrating segments...").await?;
            self.stage_segments(handle, cancel).await?;
        }

        self.check_cancel(handle, cancel).await?;
        self.enter_stage(handle, JobStage::Stitching, "Assembling recap...").await?;
        let output = self.stage_stitch(handle, cancel).await?;

        self.check_cancel(handle, cancel).await?;
        self.enter_stage(handle, JobStage::Committing, "Finalizing...").await?;
        self.stage_commit(handle, output).await
    }

    /// Cooperative cancellation check at a stage boundary. Also picks up
    /// the durable flag set while the job sat unclaimed.
    async fn check_cancel(
        &self,
        handle: &JobHandle,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let job = handle.refresh().await?;
        if job.cancel_requested {
            cancel.cancel();
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    async fn enter_stage(
        &self,
        handle: &JobHandle,
        stage: JobStage,
        step: &str,
    ) -> EngineResult<()> {
        let (base, _) = stage.progress_band();
        handle
            .patch_and_publish(
                JobPatch::new()
                    .with_stage(stage)
                    .with_progress(base)
                    .with_current_step(step),
            )
            .await?;
        debug!(stage = %stage, "Entered stage");
        Ok(())
    }

    /// Reserve estimated minutes. The estimate is capped at the account's
    /// gross capacity; the reservation key makes retries idempotent.
    async fn stage_reserve(&self, handle: &JobHandle) -> EngineResult<()> {
        let job = handle.job().await;
        let quota = self.deps.ledger.snapshot(&job.owner_id).await?;

        let estimate = job
            .source_duration_minutes()
            .min(quota.subscription_minutes_limit + quota.top_up_minutes_remaining);
        let reservation_id = self
            .deps
            .ledger
            .reserve(&job.owner_id, estimate, &reservation_key_for(&job.id))
            .await?;

        handle
            .patch_and_publish(
                JobPatch::new()
                    .with_reservation_id(reservation_id)
                    .with_progress(2.0),
            )
            .await?;
        Ok(())
    }

    /// Ensure the source blob is resident and readable. Transient read
    /// failures retry through the gate; permanent ones fail the job.
    async fn stage_ingest(
        &self,
        handle: &JobHandle,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let job = handle.job().await;
        let info = self
            .deps
            .gate
            .call(provider_ids::BLOB, cancel, || async {
                self.deps
                    .blobs
                    .head_object(&job.source)
                    .await
                    .map_err(blob_call_error)
            })
            .await?;

        debug!(job_id = %job.id, size_bytes = info.size_bytes, "Source blob verified");
        handle
            .patch_and_publish(
                JobPatch::new()
                    .with_progress(10.0)
                    .with_current_step("Source media ready"),
            )
            .await?;
        Ok(())
    }

    /// Plan segments. Planning is deterministic and never retried; a plan
    /// persisted by a previous run is reused as-is.
    async fn stage_plan(
        &self,
        handle: &JobHandle,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let job = handle.job().await;

        let existing = self.deps.store.get_segments(&job.id).await?;
        let segments = if !existing.is_empty() {
            debug!(job_id = %job.id, count = existing.len(), "Reusing persisted plan");
            existing
        } else {
            let needs_chapters = job.config.script.is_none() || job.config.ai_segment_matching;
            let chapters = if needs_chapters {
                Some(
                    self.deps
                        .gate
                        .call(provider_ids::CHAPTERS, cancel, || {
                            self.deps
                                .providers
                                .chapters
                                .chapters(&job.source, job.source_duration_seconds)
                        })
                        .await?,
                )
            } else {
                None
            };

            let planned = plan_segments(&PlanContext {
                job: &job,
                chapters: chapters.as_deref(),
                rules: &self.config.segment,
                limits: &self.config.plan_limits,
            })?;
            self.deps.store.put_segments(&job.id, &planned).await?;
            planned
        };

        handle
            .patch_and_publish(
                JobPatch::new()
                    .with_segments_planned(segments.len() as u32)
                    .with_progress(20.0)
                    .with_current_step(format!("Planned {} segments", segments.len())),
            )
            .await?;
        Ok(())
    }

    async fn stage_segments(
        &self,
        handle: &JobHandle,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let work = process_segments(
            &self.deps,
            handle,
            cancel,
            self.config.worker_concurrency_per_job,
            self.config.segment_failure_tolerance,
            &self.config.segment,
        );

        tokio::time::timeout(self.config.stage_timeouts.segment_processing, work)
            .await
            .map_err(|_| EngineError::StageTimeout {
                stage: "segment_processing",
            })??;

        handle
            .patch_and_publish(
                JobPatch::new()
                    .with_progress(90.0)
                    .with_current_step("Narration complete"),
            )
            .await?;
        Ok(())
    }

    async fn stage_stitch(
        &self,
        handle: &JobHandle,
        cancel: &CancellationToken,
    ) -> EngineResult<TranscodeOutput> {
        let job = handle.job().await;
        let segments = self.deps.store.get_segments(&job.id).await?;

        let output = tokio::time::timeout(
            self.config.stage_timeouts.stitching,
            stitch(&self.deps, cancel, &job, &segments),
        )
        .await
        .map_err(|_| EngineError::StageTimeout { stage: "stitching" })??;

        handle
            .patch_and_publish(
                JobPatch::new()
                    .with_progress(97.0)
                    .with_current_step("Recap assembled"),
            )
            .await?;
        Ok(output)
    }

    /// Commit billed minutes, then (and only then) mark the job
    /// `Completed` and emit the signed billing notice.
    async fn stage_commit(
        &self,
        handle: &JobHandle,
        output: TranscodeOutput,
    ) -> EngineResult<()> {
        let job = handle.job().await;
        let reservation_id = job.reservation_id.clone().ok_or_else(|| {
            EngineError::internal(format!("job {} reached Committing without a reservation", job.id))
        })?;

        let minutes = if self.config.bill_source_minutes {
            job.source_duration_minutes()
        } else {
            output.duration_seconds / 60.0
        };
        let billing_period = current_billing_period();

        let record = self
            .commit_with_retry(&reservation_id, minutes, &job.id, &billing_period)
            .await?;

        let terminal = self
            .deps
            .store
            .mark_terminal(
                &job.id,
                TerminalOutcome::Completed {
                    output: output.output.clone(),
                    output_duration_seconds: output.duration_seconds,
                },
            )
            .await?;
        self.publish_terminal(&terminal);
        self.emit_billing_notice(&job, &record).await;
        Ok(())
    }

    async fn commit_with_retry(
        &self,
        reservation_id: &str,
        minutes: f64,
        job_id: &JobId,
        billing_period: &str,
    ) -> EngineResult<UsageRecord> {
        let mut last_error = None;
        for attempt in 0..3 {
            match self
                .deps
                .ledger
                .commit(reservation_id, minutes, job_id, billing_period)
                .await
            {
                Ok(record) => return Ok(record),
                Err(e @ StoreError::ReservationNotFound(_)) => return Err(e.into()),
                Err(e) => {
                    warn!(job_id = %job_id, attempt = attempt + 1, error = %e, "Commit failed");
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_millis(200 * (attempt + 1))).await;
                }
            }
        }
        Err(EngineError::CommitDeferred(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown commit failure".to_string()),
        ))
    }

    fn publish_terminal(&self, job: &Job) {
        self.deps
            .bus
            .publish(ProgressEvent::from_job(job, job.event_seq));
    }

    async fn emit_billing_notice(&self, job: &Job, record: &UsageRecord) {
        let notice = BillingNotice {
            job_id: job.id.clone(),
            user_id: job.owner_id.clone(),
            billed_minutes: record.minutes_billed,
            billing_period: record.billing_period.clone(),
        };
        match sign_notice(&notice, &self.config.billing_secret) {
            Ok(signed) => {
                if let Err(e) = self.deps.providers.billing.deliver(&notice, &signed).await {
                    // The sink is idempotent and the usage record is the
                    // source of truth; delivery failures are not fatal.
                    warn!(job_id = %job.id, error = %e, "Billing notice delivery failed");
                }
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "Failed to sign billing notice"),
        }
    }

    /// Terminal path for cancellation: release the reservation, write the
    /// outcome, emit the terminal event. No usage record is written.
    async fn finalize_cancelled(&self, handle: &JobHandle) {
        let job = handle.job().await;
        info!(job_id = %job.id, "Finalizing cancelled job");

        if let Some(reservation_id) = &job.reservation_id {
            if let Err(e) = self.deps.ledger.release(reservation_id).await {
                warn!(job_id = %job.id, error = %e, "Failed to release reservation");
            }
        }

        match self
            .deps
            .store
            .mark_terminal(&job.id, TerminalOutcome::Cancelled)
            .await
        {
            Ok(terminal) => self.publish_terminal(&terminal),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to mark job cancelled"),
        }
    }

    /// Terminal path for failure: release the reservation, record the
    /// tagged error, emit the terminal event.
    async fn finalize_failed(&self, handle: &JobHandle, failure: &EngineError) {
        let job = handle.job().await;
        let terminal_error = failure.terminal_error();
        error!(
            job_id = %job.id,
            kind = %terminal_error.kind,
            error = %failure,
            "Job failed"
        );

        if let Some(reservation_id) = &job.reservation_id {
            if let Err(e) = self.deps.ledger.release(reservation_id).await {
                warn!(job_id = %job.id, error = %e, "Failed to release reservation");
            }
        }

        match self
            .deps
            .store
            .mark_terminal(&job.id, TerminalOutcome::Failed(terminal_error))
            .await
        {
            Ok(terminal) => self.publish_terminal(&terminal),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to mark job failed"),
        }
    }
}
