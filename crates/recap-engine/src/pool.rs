//! Segment worker pool.
//!
//! Runs describe -> synthesize -> align for every planned segment with a
//! configurable parallelism, every outbound call gated by the external
//! call gate. Segments complete in any order; the job's completed counter
//! only ever advances. Segments already `Done` (recovered via their
//! fingerprint from a previous run) are skipped, not re-billed work.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use recap_blob::{BlobError, BlobStore as _};
use recap_gate::CallError;
use recap_models::{Job, JobPatch, JobStage, Segment, SegmentStatus};
use recap_store::JobStore as _;

use crate::config::SegmentRules;
use crate::context::{EngineDeps, JobHandle};
use crate::error::{EngineError, EngineResult};
use crate::providers::{
    provider_ids, DescribeRequest, SpeechSynthesizer as _, VisualDescriber as _,
};

/// Map blob gateway failures into the gate's classification.
pub(crate) fn blob_call_error(error: BlobError) -> CallError {
    if error.is_transient() {
        CallError::transient(error.to_string())
    } else {
        CallError::permanent(error.to_string())
    }
}

/// Process all planned segments for a job.
///
/// The pool is told in advance how many segment failures are tolerable;
/// when the tolerance is exceeded it cancels all in-flight work and
/// returns the first error.
pub async fn process_segments(
    deps: &Arc<EngineDeps>,
    handle: &JobHandle,
    cancel: &CancellationToken,
    parallelism: usize,
    failure_tolerance: u32,
    rules: &SegmentRules,
) -> EngineResult<()> {
    let job = handle.job().await;
    let segments = deps.store.get_segments(&job.id).await?;
    let planned = segments.len() as u32;
    if planned == 0 {
        return Err(EngineError::internal("no segments planned"));
    }

    let (base, ceiling) = JobStage::SegmentProcessing.progress_band();
    let span = ceiling - base;

    let initially_done = segments
        .iter()
        .filter(|s| s.status == SegmentStatus::Done)
        .count() as u32;
    if initially_done > 0 {
        debug!(
            job_id = %job.id,
            reused = initially_done,
            "Reusing completed segments from fingerprint cache"
        );
    }

    handle
        .patch_and_publish(
            JobPatch::new()
                .with_segments_completed(initially_done)
                .with_progress(base + span * f64::from(initially_done) / f64::from(planned))
                .with_current_step(format!(
                    "Narrating {} segments...",
                    planned - initially_done
                )),
        )
        .await?;

    let completed = AtomicU32::new(initially_done);
    let failures = AtomicU32::new(0);
    let first_error: Mutex<Option<EngineError>> = Mutex::new(None);
    let pool_cancel = cancel.child_token();
    let semaphore = Semaphore::new(parallelism.max(1));

    let record_failure = |error: EngineError| {
        let failed = failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failed > failure_tolerance {
            let mut slot = first_error.lock().expect("pool error slot poisoned");
            if slot.is_none() {
                *slot = Some(error);
            }
            pool_cancel.cancel();
        }
    };

    let workers = segments
        .into_iter()
        .filter(|s| s.status != SegmentStatus::Done)
        .map(|mut segment| {
            let job = &job;
            let pool_cancel = &pool_cancel;
            let semaphore = &semaphore;
            let completed = &completed;
            let record_failure = &record_failure;

            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if pool_cancel.is_cancelled() {
                    return;
                }

                match process_one(deps, pool_cancel, job, &mut segment, rules).await {
                    Ok(()) => {
                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        let progress = base + span * f64::from(done) / f64::from(planned);
                        let patch = JobPatch::new()
                            .with_segments_completed(done)
                            .with_progress(progress)
                            .with_current_step(format!("Narrated segment {done}/{planned}"));
                        if let Err(e) = handle.patch_and_publish(patch).await {
                            if !e.is_cancelled() {
                                record_failure(e);
                            }
                        }
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => {
                        warn!(job_id = %job.id, segment = segment.index, error = %e, "Segment failed");
                        // The persisted segment carries its terminal status
                        // and error text.
                        segment.fail(e.to_string());
                        if let Err(persist) = deps.store.update_segment(&segment).await {
                            warn!(
                                job_id = %job.id,
                                segment = segment.index,
                                error = %persist,
                                "Failed to persist segment failure"
                            );
                        }
                        record_failure(e);
                    }
                }
            }
        })
        .collect::<Vec<_>>();

    join_all(workers).await;

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    if let Some(error) = first_error.lock().expect("pool error slot poisoned").take() {
        return Err(error);
    }

    let failed = failures.load(Ordering::SeqCst);
    if failed > 0 {
        warn!(job_id = %job.id, failed, "Tolerated segment failures");
    }
    Ok(())
}

/// Run one segment through describe -> synthesize -> align.
async fn process_one(
    deps: &Arc<EngineDeps>,
    cancel: &CancellationToken,
    job: &Job,
    segment: &mut Segment,
    rules: &SegmentRules,
) -> EngineResult<()> {
    // Script-derived segments arrive with their narration preset and
    // skip the describe call entirely.
    let narration = match segment.narration.clone() {
        Some(preset) => preset,
        None => {
            segment.status = SegmentStatus::Describing;
            deps.store.update_segment(segment).await?;

            let target_words = (segment.duration() * rules.words_per_second).round() as u32;
            deps.gate
                .call(provider_ids::VISION, cancel, || {
                    deps.providers.describer.describe(DescribeRequest {
                        source: &job.source,
                        start: segment.start,
                        end: segment.end,
                        target_words: Some(target_words.max(1)),
                        character_guide: job.config.character_guide.as_deref(),
                        series_id: job.config.series_id.as_deref(),
                    })
                })
                .await?
        }
    };

    segment.narration = Some(narration.clone());
    segment.status = SegmentStatus::Synthesizing;
    deps.store.update_segment(segment).await?;

    let audio = deps
        .gate
        .call(provider_ids::TTS, cancel, || {
            deps.providers.synthesizer.synthesize(&narration)
        })
        .await?;

    let audio_key = format!("jobs/{}/narration/{}", job.id, segment.index);
    let audio_handle = deps
        .gate
        .call(provider_ids::BLOB, cancel, || {
            let bytes = audio.audio.clone();
            let content_type = audio.content_type.clone();
            let key = audio_key.clone();
            async move {
                deps.blobs
                    .put_object(&key, bytes, &content_type)
                    .await
                    .map_err(blob_call_error)
            }
        })
        .await?;

    segment.status = SegmentStatus::Aligning;
    deps.store.update_segment(segment).await?;

    let speed_factor =
        (audio.duration_seconds / segment.duration()).clamp(rules.speed_min, rules.speed_max);

    segment.complete(narration, audio_handle, speed_factor);
    deps.store.update_segment(segment).await?;
    debug!(job_id = %job.id, segment = segment.index, speed_factor, "Segment done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_error_classification() {
        let transient = blob_call_error(BlobError::download_failed("io"));
        assert!(matches!(transient, CallError::Transient(_)));

        let permanent = blob_call_error(BlobError::not_found("gone"));
        assert!(matches!(permanent, CallError::Permanent(_)));
    }
}
