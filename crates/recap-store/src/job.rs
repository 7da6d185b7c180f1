//! Job store trait and shared patch semantics.

use async_trait::async_trait;
use chrono::Utc;

use recap_models::{Job, JobId, JobPatch, JobSnapshot, Segment, TerminalOutcome};

use crate::error::StoreResult;

/// Apply a patch to a job in place, enforcing the store invariants:
/// progress and the completed counter never regress, the event-sequence
/// high-water mark only advances, and terminal stages are frozen.
///
/// Returns `true` if anything changed. Both backends funnel updates
/// through this function so the invariants hold regardless of medium.
pub fn apply_patch(job: &mut Job, patch: &JobPatch) -> bool {
    if job.stage.is_terminal() {
        return false;
    }

    let mut changed = false;

    if let Some(stage) = patch.stage {
        if job.stage != stage {
            job.stage = stage;
            changed = true;
        }
    }
    if let Some(progress) = patch.progress {
        if progress > job.progress {
            job.progress = progress.min(100.0);
            changed = true;
        }
    }
    if let Some(ref step) = patch.current_step {
        if &job.current_step != step {
            job.current_step = step.clone();
            changed = true;
        }
    }
    if let Some(planned) = patch.segments_planned {
        if job.segments_planned != planned {
            job.segments_planned = planned;
            changed = true;
        }
    }
    if let Some(completed) = patch.segments_completed {
        if completed > job.segments_completed {
            job.segments_completed = completed;
            changed = true;
        }
    }
    if let Some(ref reservation) = patch.reservation_id {
        if job.reservation_id.as_deref() != Some(reservation.as_str()) {
            job.reservation_id = Some(reservation.clone());
            changed = true;
        }
    }
    if let Some(seq) = patch.event_seq {
        if seq > job.event_seq {
            job.event_seq = seq;
            changed = true;
        }
    }

    if changed {
        job.updated_at = Utc::now();
    }
    changed
}

/// Apply a terminal outcome to a job in place.
///
/// A no-op if the job is already terminal (returns `false`); once a job
/// is terminal its stage never changes.
pub fn apply_terminal(job: &mut Job, outcome: &TerminalOutcome) -> bool {
    use recap_models::JobStage;

    if job.stage.is_terminal() {
        return false;
    }

    match outcome {
        TerminalOutcome::Completed {
            output,
            output_duration_seconds,
        } => {
            job.stage = JobStage::Completed;
            job.progress = 100.0;
            job.current_step = "Complete".to_string();
            job.output = Some(output.clone());
            job.output_duration_seconds = Some(*output_duration_seconds);
            job.error = None;
            job.terminal_committed = true;
        }
        TerminalOutcome::Failed(error) => {
            job.stage = JobStage::Failed;
            job.current_step = "Failed".to_string();
            job.error = Some(error.clone());
        }
        TerminalOutcome::Cancelled => {
            job.stage = JobStage::Cancelled;
            job.current_step = "Cancelled".to_string();
        }
    }

    job.lease = None;
    // The terminal progress event carries this sequence; bumping it here
    // keeps snapshots and the event stream consistent for late subscribers.
    job.event_seq += 1;
    job.updated_at = Utc::now();
    true
}

/// Durable record of jobs, their segments and leases.
///
/// Updates use optimistic concurrency keyed by `(job_id, revision)`;
/// a mismatch returns [`crate::StoreError::RevisionConflict`] and the
/// caller re-reads and re-applies. All writes are durable before the
/// call returns.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new pending job and enqueue it for claiming.
    async fn create(&self, job: Job) -> StoreResult<JobId>;

    /// Claim the next pending job, setting a lease for `lease_seconds`.
    async fn claim(&self, worker_id: &str, lease_seconds: u64) -> StoreResult<Option<Job>>;

    /// Re-claim a specific job whose lease has expired (crash recovery).
    /// Returns `None` if the job is terminal or its lease is still live.
    async fn reclaim(
        &self,
        job_id: &JobId,
        worker_id: &str,
        lease_seconds: u64,
    ) -> StoreResult<Option<Job>>;

    /// Extend the lease held by `worker_id`. Fails with `LeaseLost` if the
    /// job is now leased by another worker or is terminal.
    async fn renew_lease(
        &self,
        job_id: &JobId,
        worker_id: &str,
        lease_seconds: u64,
    ) -> StoreResult<()>;

    /// Apply a patch under optimistic concurrency; returns the updated job.
    async fn update(&self, job_id: &JobId, revision: u64, patch: JobPatch) -> StoreResult<Job>;

    /// Fetch the full job record, including lease and revision.
    async fn get(&self, job_id: &JobId) -> StoreResult<Job>;

    /// Fetch the public snapshot.
    async fn get_snapshot(&self, job_id: &JobId) -> StoreResult<JobSnapshot>;

    /// List an owner's jobs, newest first.
    async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<JobSnapshot>>;

    /// Write the terminal outcome. Idempotent: marking an already-terminal
    /// job returns it unchanged.
    async fn mark_terminal(&self, job_id: &JobId, outcome: TerminalOutcome) -> StoreResult<Job>;

    /// Flag the job for cooperative cancellation. Idempotent; fails with
    /// `TerminalJob` if the job already completed or failed.
    async fn request_cancel(&self, job_id: &JobId) -> StoreResult<JobSnapshot>;

    /// Jobs whose lease has expired while still non-terminal.
    async fn list_pending_for_recovery(&self) -> StoreResult<Vec<Job>>;

    /// Persist the planned segments for a job (replaces any existing plan).
    async fn put_segments(&self, job_id: &JobId, segments: &[Segment]) -> StoreResult<()>;

    /// Load the planned segments in index order.
    async fn get_segments(&self, job_id: &JobId) -> StoreResult<Vec<Segment>>;

    /// Persist one segment's state (keyed by job and index).
    async fn update_segment(&self, segment: &Segment) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use recap_models::{BlobHandle, ErrorKind, JobConfig, JobStage, TerminalError};

    fn sample_job() -> Job {
        Job::new(
            "user-1",
            BlobHandle::new("media", "s.mp4"),
            600.0,
            JobConfig::default(),
        )
    }

    #[test]
    fn test_patch_progress_never_regresses() {
        let mut job = sample_job();
        job.progress = 50.0;

        let changed = apply_patch(&mut job, &JobPatch::new().with_progress(30.0));
        assert!(!changed);
        assert_eq!(job.progress, 50.0);

        let changed = apply_patch(&mut job, &JobPatch::new().with_progress(55.0));
        assert!(changed);
        assert_eq!(job.progress, 55.0);
    }

    #[test]
    fn test_patch_completed_never_regresses() {
        let mut job = sample_job();
        job.segments_completed = 10;

        apply_patch(&mut job, &JobPatch::new().with_segments_completed(7));
        assert_eq!(job.segments_completed, 10);

        apply_patch(&mut job, &JobPatch::new().with_segments_completed(11));
        assert_eq!(job.segments_completed, 11);
    }

    #[test]
    fn test_patch_ignored_after_terminal() {
        let mut job = sample_job();
        apply_terminal(
            &mut job,
            &TerminalOutcome::Failed(TerminalError::new(ErrorKind::Internal, "boom")),
        );

        let changed = apply_patch(
            &mut job,
            &JobPatch::new()
                .with_stage(JobStage::SegmentProcessing)
                .with_progress(99.0),
        );
        assert!(!changed);
        assert_eq!(job.stage, JobStage::Failed);
    }

    #[test]
    fn test_terminal_applied_once() {
        let mut job = sample_job();
        assert!(apply_terminal(&mut job, &TerminalOutcome::Cancelled));
        assert!(!apply_terminal(
            &mut job,
            &TerminalOutcome::Completed {
                output: BlobHandle::new("media", "out.mp4"),
                output_duration_seconds: 360.0,
            }
        ));
        assert_eq!(job.stage, JobStage::Cancelled);
        assert!(!job.terminal_committed);
    }

    #[test]
    fn test_completed_outcome_sets_commit_guard() {
        let mut job = sample_job();
        apply_terminal(
            &mut job,
            &TerminalOutcome::Completed {
                output: BlobHandle::new("media", "out.mp4"),
                output_duration_seconds: 360.0,
            },
        );
        assert_eq!(job.stage, JobStage::Completed);
        assert_eq!(job.progress, 100.0);
        assert!(job.terminal_committed);
        assert_eq!(job.output_duration_seconds, Some(360.0));
        assert!(job.lease.is_none());
    }
}
