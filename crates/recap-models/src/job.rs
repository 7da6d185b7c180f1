//! Job definitions for the pipeline engine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::blob::BlobHandle;
use crate::outcome::TerminalError;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline stage of a job.
///
/// Stages advance strictly in declaration order; `Completed`, `Failed`
/// and `Cancelled` are terminal and never change once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// Waiting to be claimed by a controller
    #[default]
    Pending,
    /// Reserving quota minutes
    Reserving,
    /// Verifying the source blob is resident and readable
    Ingesting,
    /// Planning narration segments
    Planning,
    /// Running per-segment describe / synthesize / align work
    SegmentProcessing,
    /// Assembling the output via the media transcoder
    Stitching,
    /// Committing billed minutes to the quota ledger
    Committing,
    /// Done; billing committed
    Completed,
    /// Failed with a terminal error
    Failed,
    /// Cancelled by the owner
    Cancelled,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Pending => "pending",
            JobStage::Reserving => "reserving",
            JobStage::Ingesting => "ingesting",
            JobStage::Planning => "planning",
            JobStage::SegmentProcessing => "segment_processing",
            JobStage::Stitching => "stitching",
            JobStage::Committing => "committing",
            JobStage::Completed => "completed",
            JobStage::Failed => "failed",
            JobStage::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal stage (no more updates expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStage::Completed | JobStage::Failed | JobStage::Cancelled
        )
    }

    /// Progress band `(base, ceiling)` occupied by this stage.
    ///
    /// Terminal stages report the point the job had reached; `Completed`
    /// is pinned to 100.
    pub fn progress_band(&self) -> (f64, f64) {
        match self {
            JobStage::Pending => (0.0, 0.0),
            JobStage::Reserving => (0.0, 2.0),
            JobStage::Ingesting => (2.0, 10.0),
            JobStage::Planning => (10.0, 20.0),
            JobStage::SegmentProcessing => (20.0, 90.0),
            JobStage::Stitching => (90.0, 97.0),
            JobStage::Committing => (97.0, 100.0),
            JobStage::Completed => (100.0, 100.0),
            JobStage::Failed | JobStage::Cancelled => (0.0, 100.0),
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration bag supplied at admission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct JobConfig {
    /// Target recap duration in minutes (selection allows ~10% over)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_duration_minutes: Option<f64>,

    /// Optional override script; paragraphs become narration segments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    /// Optional series identifier for character persistence across episodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_id: Option<String>,

    /// Optional character name guide handed to the describe provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_guide: Option<String>,

    /// Split every segment into fragments of a few seconds
    #[serde(default)]
    pub short_clip_mode: bool,

    /// Snap script segments to provider chapter boundaries
    #[serde(default)]
    pub ai_segment_matching: bool,
}

/// A time-bounded claim on a job by a controller instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobLease {
    /// Claiming controller instance
    pub worker_id: String,
    /// Lease expiry; a non-terminal job past this deadline is recoverable
    pub deadline: DateTime<Utc>,
}

impl JobLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }
}

/// One end-to-end processing request for a single source video.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Owning user; fixed for the job's entire lifecycle
    pub owner_id: String,

    /// Current pipeline stage
    #[serde(default)]
    pub stage: JobStage,

    /// Monotonically non-decreasing progress in [0, 100]
    #[serde(default)]
    pub progress: f64,

    /// Human-readable description of the current step
    pub current_step: String,

    /// Number of planned narration segments
    #[serde(default)]
    pub segments_planned: u32,

    /// Number of completed narration segments
    #[serde(default)]
    pub segments_completed: u32,

    /// Source media blob
    pub source: BlobHandle,

    /// Source duration in seconds, measured at upload time
    pub source_duration_seconds: f64,

    /// Admission configuration
    #[serde(default)]
    pub config: JobConfig,

    /// Rendered output blob, set when completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<BlobHandle>,

    /// Measured output duration in seconds, set iff completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_duration_seconds: Option<f64>,

    /// Terminal error record, set iff failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TerminalError>,

    /// Guards exactly-once billing: set together with `Completed`
    #[serde(default)]
    pub terminal_committed: bool,

    /// Quota reservation held for this job, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,

    /// Cooperative cancellation flag, checked at suspension points
    #[serde(default)]
    pub cancel_requested: bool,

    /// Progress-event high-water mark (per-job sequence)
    #[serde(default)]
    pub event_seq: u64,

    /// Current lease, if claimed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<JobLease>,

    /// Optimistic-concurrency revision, bumped on every write
    #[serde(default)]
    pub revision: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(
        owner_id: impl Into<String>,
        source: BlobHandle,
        source_duration_seconds: f64,
        config: JobConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            owner_id: owner_id.into(),
            stage: JobStage::Pending,
            progress: 0.0,
            current_step: "Queued".to_string(),
            segments_planned: 0,
            segments_completed: 0,
            source,
            source_duration_seconds,
            config,
            output: None,
            output_duration_seconds: None,
            error: None,
            terminal_committed: false,
            reservation_id: None,
            cancel_requested: false,
            event_seq: 0,
            lease: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Source duration in minutes.
    pub fn source_duration_minutes(&self) -> f64 {
        self.source_duration_seconds / 60.0
    }

    /// Public snapshot without internal fields (revision, lease).
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            stage: self.stage,
            progress: self.progress,
            current_step: self.current_step.clone(),
            segments_planned: self.segments_planned,
            segments_completed: self.segments_completed,
            source: self.source.clone(),
            source_duration_seconds: self.source_duration_seconds,
            config: self.config.clone(),
            output: self.output.clone(),
            output_duration_seconds: self.output_duration_seconds,
            error: self.error.clone(),
            event_seq: self.event_seq,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Public view of a job, minus lease and revision metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobSnapshot {
    pub id: JobId,
    pub owner_id: String,
    pub stage: JobStage,
    pub progress: f64,
    pub current_step: String,
    pub segments_planned: u32,
    pub segments_completed: u32,
    pub source: BlobHandle,
    pub source_duration_seconds: f64,
    pub config: JobConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<BlobHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TerminalError>,
    pub event_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// A partial update applied to a job under optimistic concurrency.
///
/// The store enforces the invariants: progress and the completed counter
/// never regress, and a terminal stage is never overwritten.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    pub stage: Option<JobStage>,
    pub progress: Option<f64>,
    pub current_step: Option<String>,
    pub segments_planned: Option<u32>,
    pub segments_completed: Option<u32>,
    pub reservation_id: Option<String>,
    pub event_seq: Option<u64>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: JobStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress.clamp(0.0, 100.0));
        self
    }

    pub fn with_current_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn with_segments_planned(mut self, planned: u32) -> Self {
        self.segments_planned = Some(planned);
        self
    }

    pub fn with_segments_completed(mut self, completed: u32) -> Self {
        self.segments_completed = Some(completed);
        self
    }

    pub fn with_reservation_id(mut self, id: impl Into<String>) -> Self {
        self.reservation_id = Some(id.into());
        self
    }

    pub fn with_event_seq(mut self, seq: u64) -> Self {
        self.event_seq = Some(seq);
        self
    }

    /// Whether the patch carries any change at all.
    pub fn is_empty(&self) -> bool {
        self.stage.is_none()
            && self.progress.is_none()
            && self.current_step.is_none()
            && self.segments_planned.is_none()
            && self.segments_completed.is_none()
            && self.reservation_id.is_none()
            && self.event_seq.is_none()
    }
}
