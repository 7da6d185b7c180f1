//! Narration segments.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::blob::BlobHandle;
use crate::job::JobId;

/// Per-segment processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    /// Created by the planner, not yet picked up
    #[default]
    Planned,
    /// Narration text is being generated
    Describing,
    /// Narration audio is being synthesized
    Synthesizing,
    /// Speed factor is being computed
    Aligning,
    /// Narration and audio are ready for stitching
    Done,
    /// Gave up after the provider's retry budget
    Failed,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentStatus::Planned => "planned",
            SegmentStatus::Describing => "describing",
            SegmentStatus::Synthesizing => "synthesizing",
            SegmentStatus::Aligning => "aligning",
            SegmentStatus::Done => "done",
            SegmentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SegmentStatus::Done | SegmentStatus::Failed)
    }
}

/// A planned unit of work inside a job: a contiguous sub-interval of the
/// source with a narration.
///
/// Segments are created together with the plan and never added later;
/// their order (by `index`) is stable. The `fingerprint` keys a cache of
/// narration text and audio handles so completed work survives retries
/// and crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Segment {
    /// Owning job
    pub job_id: JobId,

    /// 0-based dense index within the plan
    pub index: u32,

    /// Interval start in the source, seconds
    pub start: f64,

    /// Interval end in the source, seconds (`end > start`)
    pub end: f64,

    /// Stable hash of `{job, index, start, end}` plus script-override text
    pub fingerprint: String,

    /// Processing status
    #[serde(default)]
    pub status: SegmentStatus,

    /// Selection weight assigned by the planner
    #[serde(default)]
    pub importance: f64,

    /// Narration text; preset for script-derived segments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,

    /// Synthesized narration audio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<BlobHandle>,

    /// Playback speed factor applied at stitch time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_factor: Option<f64>,

    /// Error message if the segment failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Segment {
    /// Interval duration in seconds.
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Mark this segment done with its narration results.
    pub fn complete(&mut self, narration: String, audio: BlobHandle, speed_factor: f64) {
        self.narration = Some(narration);
        self.audio = Some(audio);
        self.speed_factor = Some(speed_factor);
        self.error = None;
        self.status = SegmentStatus::Done;
    }

    /// Mark this segment failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.status = SegmentStatus::Failed;
    }
}
