//! Progress events published per job.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId, JobStage};
use crate::outcome::TerminalError;

/// One observation of a job's progress, fanned out to subscribers.
///
/// `sequence` is strictly increasing per job; subscribers use it to
/// detect gaps and resync from the job-store snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub sequence: u64,
    pub stage: JobStage,
    pub progress: f64,
    pub current_step: String,
    pub segments_completed: u32,
    pub segments_planned: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_error: Option<TerminalError>,
}

impl ProgressEvent {
    /// Build an event from a job's current state; the bus assigns the sequence.
    pub fn from_job(job: &Job, sequence: u64) -> Self {
        Self {
            job_id: job.id.clone(),
            sequence,
            stage: job.stage,
            progress: job.progress,
            current_step: job.current_step.clone(),
            segments_completed: job.segments_completed,
            segments_planned: job.segments_planned,
            terminal_error: job.error.clone(),
        }
    }

    /// Whether this is the last event the job will ever publish.
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobHandle;
    use crate::job::JobConfig;

    #[test]
    fn test_event_from_job() {
        let mut job = Job::new(
            "user-1",
            BlobHandle::new("media", "s.mp4"),
            600.0,
            JobConfig::default(),
        );
        job.stage = JobStage::SegmentProcessing;
        job.progress = 55.0;
        job.segments_planned = 18;
        job.segments_completed = 9;

        let event = ProgressEvent::from_job(&job, 42);
        assert_eq!(event.sequence, 42);
        assert_eq!(event.progress, 55.0);
        assert_eq!(event.segments_completed, 9);
        assert!(!event.is_terminal());
    }
}
