//! Stitcher.
//!
//! Orders completed segments, builds the assembly plan and hands it to
//! the media transcoder. Everything else (muxing, encoding, re-timing)
//! is the transcoder's problem. Transcoder crashes are common and the
//! assembly plan is stable, so one retry is allowed.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use recap_models::{Job, Segment, SegmentStatus};

use crate::context::EngineDeps;
use crate::error::{EngineError, EngineResult};
use crate::providers::{AssemblyStep, MediaTranscoder as _, TranscodeOutput};

/// Build the ordered assembly plan from completed segments.
pub fn assembly_plan(segments: &[Segment]) -> EngineResult<Vec<AssemblyStep>> {
    let mut done: Vec<&Segment> = segments
        .iter()
        .filter(|s| s.status == SegmentStatus::Done)
        .collect();
    done.sort_by_key(|s| s.index);

    if done.is_empty() {
        return Err(EngineError::stitcher("no completed segments to assemble"));
    }

    done.into_iter()
        .map(|segment| {
            let audio = segment
                .audio
                .clone()
                .ok_or_else(|| {
                    EngineError::internal(format!("segment {} done without audio", segment.index))
                })?;
            let speed_factor = segment.speed_factor.ok_or_else(|| {
                EngineError::internal(format!(
                    "segment {} done without speed factor",
                    segment.index
                ))
            })?;
            Ok(AssemblyStep {
                start: segment.start,
                end: segment.end,
                audio,
                speed_factor,
            })
        })
        .collect()
}

/// Run the transcoder over the assembly plan, retrying once.
pub async fn stitch(
    deps: &Arc<EngineDeps>,
    cancel: &CancellationToken,
    job: &Job,
    segments: &[Segment],
) -> EngineResult<TranscodeOutput> {
    let plan = assembly_plan(segments)?;

    let mut last_error = None;
    for attempt in 0..2 {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = deps.providers.transcoder.assemble(&job.source, &plan) => result,
        };

        match result {
            Ok(output) => return Ok(output),
            Err(e) => {
                warn!(job_id = %job.id, attempt = attempt + 1, error = %e, "Transcoder failed");
                last_error = Some(e);
            }
        }
    }

    Err(EngineError::stitcher(
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown transcoder failure".to_string()),
    ))
}
