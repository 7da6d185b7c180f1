//! End-to-end pipeline scenarios against in-memory backends and
//! deterministic fake providers.

mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;

use recap_engine::planner::segment_fingerprint;
use recap_engine::verify_notice;
use recap_models::{
    current_billing_period, ErrorKind, Job, JobConfig, JobLease, JobStage, ProgressEvent, Segment,
    SegmentStatus,
};
use recap_store::{JobStore, QuotaLedger};

use support::{uniform_chapters, Harness};

const WAIT: Duration = Duration::from_secs(15);

fn assert_events_well_formed(events: &[ProgressEvent]) {
    assert!(!events.is_empty(), "no progress events delivered");
    for pair in events.windows(2) {
        assert!(
            pair[1].sequence > pair[0].sequence,
            "sequence regressed: {} -> {}",
            pair[0].sequence,
            pair[1].sequence
        );
        assert!(
            pair[1].progress >= pair[0].progress,
            "progress regressed: {} -> {}",
            pair[0].progress,
            pair[1].progress
        );
    }
}

/// S1: 24-minute source, 60 subscription minutes, everything succeeds
/// on the first try. 18 segments, 6-minute output, 6.0 minutes billed.
#[tokio::test]
async fn happy_path_without_script() {
    let harness = Harness::new();
    harness.seed_account("user-1", 60.0, 0.0).await;
    harness.chapters.set(uniform_chapters(18, 30.0));

    let job_id = harness.submit("user-1", 1440.0, JobConfig::default()).await;
    let events = harness.collect_events(&job_id);
    harness.start();

    let snapshot = harness.wait_terminal(&job_id, WAIT).await;
    harness.stop().await;

    assert_eq!(snapshot.stage, JobStage::Completed);
    assert_eq!(snapshot.progress, 100.0);
    assert_eq!(snapshot.segments_planned, 18);
    assert_eq!(snapshot.segments_completed, 18);
    assert_eq!(snapshot.output_duration_seconds, Some(360.0));
    assert!(snapshot.output.is_some());

    // Exactly one usage record of 6.0 minutes in the current period.
    let record = harness
        .ledger
        .usage_for(&job_id, &current_billing_period())
        .await
        .unwrap()
        .expect("usage record must exist");
    assert_eq!(record.minutes_billed, 6.0);

    let quota = harness.ledger.snapshot("user-1").await.unwrap();
    assert_eq!(quota.subscription_minutes_used, 6.0);
    assert_eq!(quota.total_available_minutes, 54.0);

    // One signed billing notice that verifies against the engine secret.
    let notices = harness.billing.notices.lock().unwrap();
    assert_eq!(notices.len(), 1);
    let (notice, signed) = &notices[0];
    assert_eq!(notice.billed_minutes, 6.0);
    let verified = verify_notice(signed, &harness.config.billing_secret).unwrap();
    assert_eq!(verified.job_id, job_id);

    let events = events.await.unwrap();
    assert_events_well_formed(&events);
    let last = events.last().unwrap();
    assert_eq!(last.stage, JobStage::Completed);
    assert_eq!(last.progress, 100.0);
}

/// S2: 58 of 60 subscription minutes used plus a 120-minute top-up.
/// A 5-minute output bills 2 minutes from the subscription and 3 from
/// the top-up.
#[tokio::test]
async fn quota_boundary_rolls_into_topup() {
    let harness = Harness::new();
    harness.seed_account("user-1", 60.0, 58.0).await;
    harness.ledger.top_up("user-1", 120.0, "pay-1").await.unwrap();
    harness.chapters.set(uniform_chapters(20, 30.0));
    harness.transcoder.set_output_duration(300.0);

    let job_id = harness.submit("user-1", 600.0, JobConfig::default()).await;
    harness.start();

    let snapshot = harness.wait_terminal(&job_id, WAIT).await;
    harness.stop().await;

    assert_eq!(snapshot.stage, JobStage::Completed);
    let quota = harness.ledger.snapshot("user-1").await.unwrap();
    assert_eq!(quota.subscription_minutes_used, 60.0);
    assert_eq!(quota.top_up_minutes_remaining, 117.0);
}

/// S3: the TTS provider fails transiently on one segment's first
/// attempt. The retry is invisible: the job completes and the segment
/// counter increments exactly once per segment.
#[tokio::test]
async fn transient_tts_failure_is_retried() {
    let harness = Harness::new();
    harness.seed_account("user-1", 60.0, 0.0).await;
    harness.chapters.set(uniform_chapters(18, 30.0));
    // Segment index 7 starts at 210s.
    harness.synthesizer.fail_transiently("Scene at 210s", 1);

    let job_id = harness.submit("user-1", 540.0, JobConfig::default()).await;
    let events = harness.collect_events(&job_id);
    harness.start();

    let snapshot = harness.wait_terminal(&job_id, WAIT).await;
    harness.stop().await;

    assert_eq!(snapshot.stage, JobStage::Completed);
    assert_eq!(snapshot.segments_completed, 18);
    assert_eq!(harness.describer.calls.load(Ordering::SeqCst), 18);
    // 18 segments + 1 retried attempt.
    assert_eq!(harness.synthesizer.calls.load(Ordering::SeqCst), 19);

    assert_events_well_formed(&events.await.unwrap());
}

/// S4: cancellation mid-processing drains the pool, releases the
/// reservation and writes no usage record. The last event carries the
/// Cancelled stage.
#[tokio::test]
async fn cancellation_mid_processing() {
    let harness = Harness::new();
    harness.seed_account("user-1", 60.0, 0.0).await;
    harness.chapters.set(uniform_chapters(18, 30.0));
    harness.synthesizer.set_delay(Duration::from_millis(25));

    let job_id = harness.submit("user-1", 540.0, JobConfig::default()).await;
    harness.deps.bus.ensure(&job_id, 0);
    let (_replay, mut live) = harness.deps.bus.subscribe(&job_id, None).unwrap();
    harness.start();

    // Cancel once segment processing is well underway.
    let mut terminal_event = None;
    loop {
        match live.recv().await {
            Ok(event) => {
                if event.is_terminal() {
                    terminal_event = Some(event);
                    break;
                }
                if event.stage == JobStage::SegmentProcessing && event.progress >= 40.0 {
                    harness.controller.cancel(&job_id).await.unwrap();
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    // Drain to the terminal event if cancellation raced completion.
    if terminal_event.is_none() {
        loop {
            match live.recv().await {
                Ok(event) if event.is_terminal() => {
                    terminal_event = Some(event);
                    break;
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    let snapshot = harness.wait_terminal(&job_id, WAIT).await;
    harness.stop().await;

    assert_eq!(snapshot.stage, JobStage::Cancelled);
    assert_eq!(
        terminal_event.expect("terminal event").stage,
        JobStage::Cancelled
    );

    // No usage record; the reservation hold is fully returned.
    assert!(harness
        .ledger
        .usage_for(&job_id, &current_billing_period())
        .await
        .unwrap()
        .is_none());
    let quota = harness.ledger.snapshot("user-1").await.unwrap();
    assert_eq!(quota.total_available_minutes, 60.0);
    assert!(harness.billing.notices.lock().unwrap().is_empty());
}

/// S5: a controller died mid-SegmentProcessing with 10/18 segments done.
/// A new process reclaims the job after lease expiry, reuses the 10
/// finished segments via their fingerprints, and bills exactly once.
#[tokio::test]
async fn crash_recovery_reuses_finished_segments() {
    let harness = Harness::new();
    harness.seed_account("user-1", 60.0, 0.0).await;

    // State left behind by the dead controller.
    let source = harness
        .blobs
        .seed("sources/input.mp4", vec![1, 2, 3, 4], "video/mp4")
        .await;
    let mut job = Job::new("user-1", source, 1440.0, JobConfig::default());
    job.stage = JobStage::SegmentProcessing;
    job.progress = 59.0;
    job.current_step = "Narrating segments...".to_string();
    job.segments_planned = 18;
    job.segments_completed = 10;
    job.lease = Some(JobLease {
        worker_id: "dead-controller".to_string(),
        deadline: Utc::now() - chrono::Duration::seconds(300),
    });
    let reservation = harness
        .ledger
        .reserve("user-1", 24.0, &format!("resv:{}", job.id))
        .await
        .unwrap();
    job.reservation_id = Some(reservation);
    let job_id = job.id.clone();
    harness.store.create(job).await.unwrap();

    let mut segments = Vec::new();
    for index in 0..18u32 {
        let start = f64::from(index) * 30.0;
        let end = start + 30.0;
        let mut segment = Segment {
            job_id: job_id.clone(),
            index,
            start,
            end,
            fingerprint: segment_fingerprint(&job_id, index, start, end, None),
            status: SegmentStatus::Planned,
            importance: 1.0,
            narration: None,
            audio: None,
            speed_factor: None,
            error: None,
        };
        if index < 10 {
            let audio = harness
                .blobs
                .seed(
                    &format!("jobs/{}/narration/{}", job_id, index),
                    vec![0u8; 16],
                    "audio/mpeg",
                )
                .await;
            segment.complete(format!("Scene at {start:.0}s"), audio, 1.0);
        }
        segments.push(segment);
    }
    harness.store.put_segments(&job_id, &segments).await.unwrap();

    harness.start();
    let snapshot = harness.wait_terminal(&job_id, WAIT).await;
    harness.stop().await;

    assert_eq!(snapshot.stage, JobStage::Completed);
    assert_eq!(snapshot.segments_completed, 18);
    assert_eq!(snapshot.output_duration_seconds, Some(360.0));

    // Only the 8 unfinished segments were re-described and re-synthesized.
    assert_eq!(harness.describer.calls.load(Ordering::SeqCst), 8);
    assert_eq!(harness.synthesizer.calls.load(Ordering::SeqCst), 8);
    // The persisted plan was reused; no chapter refetch happened.
    assert_eq!(harness.chapters.calls.load(Ordering::SeqCst), 0);

    let finished = harness.store.get_segments(&job_id).await.unwrap();
    assert!(finished.iter().all(|s| s.status == SegmentStatus::Done));

    // Exactly one usage record despite the interrupted first run.
    let record = harness
        .ledger
        .usage_for(&job_id, &current_billing_period())
        .await
        .unwrap()
        .expect("usage record must exist");
    assert_eq!(record.minutes_billed, 6.0);
    assert_eq!(harness.billing.notices.lock().unwrap().len(), 1);
}

/// S6: a 1-minute target on a 5-second source is unplannable. The job
/// fails with PlanUnrealizable, the reservation is released and no
/// usage record exists.
#[tokio::test]
async fn planner_rejects_unrealizable_target() {
    let harness = Harness::new();
    harness.seed_account("user-1", 60.0, 0.0).await;
    harness.chapters.set(Vec::new());

    let config = JobConfig {
        target_duration_minutes: Some(1.0),
        ..JobConfig::default()
    };
    let job_id = harness.submit("user-1", 5.0, config).await;
    harness.start();

    let snapshot = harness.wait_terminal(&job_id, WAIT).await;
    harness.stop().await;

    assert_eq!(snapshot.stage, JobStage::Failed);
    let error = snapshot.error.expect("terminal error must be recorded");
    assert_eq!(error.kind, ErrorKind::PlanUnrealizable);
    assert!(!error.retriable);

    assert!(harness
        .ledger
        .usage_for(&job_id, &current_billing_period())
        .await
        .unwrap()
        .is_none());
    let quota = harness.ledger.snapshot("user-1").await.unwrap();
    assert_eq!(quota.total_available_minutes, 60.0);
}

/// A permanent provider failure on one segment fails the job (default
/// tolerance is zero) and the persisted segment records its terminal
/// Failed status and error text.
#[tokio::test]
async fn permanent_segment_failure_is_persisted() {
    let harness = Harness::new();
    harness.seed_account("user-1", 60.0, 0.0).await;
    harness.chapters.set(uniform_chapters(4, 30.0));
    // Segment index 2 starts at 60s.
    harness.synthesizer.fail_permanently("Scene at 60s");

    let job_id = harness.submit("user-1", 120.0, JobConfig::default()).await;
    harness.start();

    let snapshot = harness.wait_terminal(&job_id, WAIT).await;
    harness.stop().await;

    assert_eq!(snapshot.stage, JobStage::Failed);
    assert_eq!(
        snapshot.error.expect("terminal error").kind,
        ErrorKind::ProviderPermanent
    );

    let segments = harness.store.get_segments(&job_id).await.unwrap();
    let failed: Vec<_> = segments
        .iter()
        .filter(|s| s.status == SegmentStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].index, 2);
    let error = failed[0].error.as_deref().expect("segment error recorded");
    assert!(error.contains("tts"), "unexpected segment error: {error}");

    // Nothing billed; the reservation hold is fully returned.
    assert!(harness
        .ledger
        .usage_for(&job_id, &current_billing_period())
        .await
        .unwrap()
        .is_none());
    let quota = harness.ledger.snapshot("user-1").await.unwrap();
    assert_eq!(quota.total_available_minutes, 60.0);
}

/// Transcoder crashes are retried once; the second attempt completes
/// the job.
#[tokio::test]
async fn stitcher_retries_once() {
    let harness = Harness::new();
    harness.seed_account("user-1", 60.0, 0.0).await;
    harness.chapters.set(uniform_chapters(4, 30.0));
    harness.transcoder.fail_next(1);

    let job_id = harness.submit("user-1", 120.0, JobConfig::default()).await;
    harness.start();

    let snapshot = harness.wait_terminal(&job_id, WAIT).await;
    harness.stop().await;

    assert_eq!(snapshot.stage, JobStage::Completed);
    assert_eq!(harness.transcoder.calls.load(Ordering::SeqCst), 2);
}

/// Two transcoder failures exhaust the single retry: the job fails with
/// StitcherFailed and nothing is billed.
#[tokio::test]
async fn stitcher_failure_after_retry_fails_job() {
    let harness = Harness::new();
    harness.seed_account("user-1", 60.0, 0.0).await;
    harness.chapters.set(uniform_chapters(4, 30.0));
    harness.transcoder.fail_next(2);

    let job_id = harness.submit("user-1", 120.0, JobConfig::default()).await;
    harness.start();

    let snapshot = harness.wait_terminal(&job_id, WAIT).await;
    harness.stop().await;

    assert_eq!(snapshot.stage, JobStage::Failed);
    assert_eq!(
        snapshot.error.unwrap().kind,
        ErrorKind::StitcherFailed
    );
    assert!(harness
        .ledger
        .usage_for(&job_id, &current_billing_period())
        .await
        .unwrap()
        .is_none());
}

/// An override script skips the describe provider entirely: paragraphs
/// are narrated as written.
#[tokio::test]
async fn script_override_skips_describe() {
    let harness = Harness::new();
    harness.seed_account("user-1", 60.0, 0.0).await;

    let config = JobConfig {
        script: Some("The hero arrives.\n\nThe hero leaves.".to_string()),
        ..JobConfig::default()
    };
    let job_id = harness.submit("user-1", 60.0, config).await;
    harness.start();

    let snapshot = harness.wait_terminal(&job_id, WAIT).await;
    harness.stop().await;

    assert_eq!(snapshot.stage, JobStage::Completed);
    assert_eq!(snapshot.segments_planned, 2);
    assert_eq!(harness.describer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.chapters.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.synthesizer.calls.load(Ordering::SeqCst), 2);

    let segments = harness.store.get_segments(&job_id).await.unwrap();
    assert_eq!(segments[0].narration.as_deref(), Some("The hero arrives."));
}
