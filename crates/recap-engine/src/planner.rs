//! Segment planner.
//!
//! Splits the source into ordered narration segments with start/end times
//! and fingerprints. Planning is deterministic: the same inputs always
//! produce the same segments in the same order, which is what makes
//! crash recovery and idempotent retries expressible at all.

use sha2::{Digest, Sha256};

use recap_models::{Job, JobId, Segment, SegmentStatus};

use crate::config::{PlanLimits, SegmentRules};
use crate::error::{EngineError, EngineResult};
use crate::providers::ChapterSpan;

/// Intervals shorter than this are dropped as degenerate.
const MIN_FRAGMENT_SECONDS: f64 = 0.25;

/// Inputs to one planning run.
pub struct PlanContext<'a> {
    pub job: &'a Job,
    /// Coarse chapters from the chapter service; required when no script
    /// is given, optional boundary hints otherwise.
    pub chapters: Option<&'a [ChapterSpan]>,
    pub rules: &'a SegmentRules,
    pub limits: &'a PlanLimits,
}

/// Interval under construction, before indices are assigned.
#[derive(Debug, Clone)]
struct DraftInterval {
    start: f64,
    end: f64,
    importance: f64,
    narration: Option<String>,
    paragraph_hash: Option<String>,
}

impl DraftInterval {
    fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Stable fingerprint for a segment's work.
///
/// Start/end are hashed at millisecond precision so float formatting can
/// never destabilize the key.
pub fn segment_fingerprint(
    job_id: &JobId,
    index: u32,
    start: f64,
    end: f64,
    paragraph_hash: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{}|{}|{}",
            job_id,
            index,
            (start * 1000.0).round() as i64,
            (end * 1000.0).round() as i64
        )
        .as_bytes(),
    );
    if let Some(hash) = paragraph_hash {
        hasher.update(b"|");
        hasher.update(hash.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn paragraph_hash(paragraph: &str) -> String {
    format!("{:x}", Sha256::digest(paragraph.trim().as_bytes()))
}

/// Plan the segments for a job.
pub fn plan_segments(ctx: &PlanContext<'_>) -> EngineResult<Vec<Segment>> {
    let duration = ctx.job.source_duration_seconds;
    if duration <= 0.0 {
        return Err(EngineError::plan("source video has no duration"));
    }

    if let Some(target) = ctx.job.config.target_duration_minutes {
        let target_seconds = target * 60.0;
        if target_seconds > duration {
            return Err(EngineError::plan(format!(
                "target duration {:.1}s exceeds the {:.1}s source",
                target_seconds, duration
            )));
        }
    }

    let mut intervals = match ctx.job.config.script.as_deref() {
        Some(script) => {
            let mut intervals = script_intervals(script, duration)?;
            if ctx.job.config.ai_segment_matching {
                if let Some(chapters) = ctx.chapters {
                    snap_to_chapters(&mut intervals, chapters, ctx.rules.snap_tolerance);
                }
            }
            intervals
        }
        None => chapter_intervals(ctx.chapters.unwrap_or(&[]), duration, ctx.rules),
    };

    if ctx.job.config.short_clip_mode {
        intervals = short_clip_split(intervals, ctx.rules.short_clip_max);
    }

    if let Some(target) = ctx.job.config.target_duration_minutes {
        intervals = select_for_target(
            intervals,
            target * 60.0,
            ctx.limits.target_overrun_factor,
        );
    }

    intervals.retain(|i| i.duration() >= MIN_FRAGMENT_SECONDS);
    if intervals.is_empty() {
        return Err(EngineError::plan("planning produced no segments"));
    }

    intervals.sort_by(|a, b| a.start.total_cmp(&b.start));

    let segments = intervals
        .into_iter()
        .enumerate()
        .map(|(index, interval)| {
            let index = index as u32;
            Segment {
                job_id: ctx.job.id.clone(),
                index,
                start: interval.start,
                end: interval.end,
                fingerprint: segment_fingerprint(
                    &ctx.job.id,
                    index,
                    interval.start,
                    interval.end,
                    interval.paragraph_hash.as_deref(),
                ),
                status: SegmentStatus::Planned,
                importance: interval.importance,
                narration: interval.narration,
                audio: None,
                speed_factor: None,
                error: None,
            }
        })
        .collect();

    Ok(segments)
}

/// Split an override script into non-empty paragraphs.
fn split_paragraphs(script: &str) -> Vec<String> {
    script
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// Pass 1 of the script matcher: allocate intervals proportionally to
/// paragraph word counts over the source duration. The number of
/// segments equals the paragraph count.
fn script_intervals(script: &str, duration: f64) -> EngineResult<Vec<DraftInterval>> {
    let paragraphs = split_paragraphs(script);
    if paragraphs.is_empty() {
        return Err(EngineError::plan("override script has no paragraphs"));
    }

    let weights: Vec<f64> = paragraphs
        .iter()
        .map(|p| p.split_whitespace().count().max(1) as f64)
        .collect();
    let total: f64 = weights.iter().sum();

    let mut intervals = Vec::with_capacity(paragraphs.len());
    let mut cursor = 0.0;
    let mut cumulative = 0.0;
    for (paragraph, weight) in paragraphs.into_iter().zip(weights) {
        cumulative += weight;
        let end = duration * cumulative / total;
        intervals.push(DraftInterval {
            start: cursor,
            end,
            importance: weight / total,
            paragraph_hash: Some(paragraph_hash(&paragraph)),
            narration: Some(paragraph),
        });
        cursor = end;
    }
    Ok(intervals)
}

/// Pass 2 of the script matcher: pull interior boundaries onto nearby
/// chapter boundaries, keeping both neighbors non-degenerate.
fn snap_to_chapters(intervals: &mut [DraftInterval], chapters: &[ChapterSpan], tolerance: f64) {
    if intervals.len() < 2 || chapters.is_empty() {
        return;
    }

    let mut anchors: Vec<f64> = chapters.iter().flat_map(|c| [c.start, c.end]).collect();
    anchors.sort_by(f64::total_cmp);

    for i in 0..intervals.len() - 1 {
        let boundary = intervals[i].end;
        let nearest = anchors
            .iter()
            .copied()
            .min_by(|a, b| (a - boundary).abs().total_cmp(&(b - boundary).abs()));

        let Some(anchor) = nearest else { continue };
        if (anchor - boundary).abs() > tolerance {
            continue;
        }
        if anchor - intervals[i].start < MIN_FRAGMENT_SECONDS
            || intervals[i + 1].end - anchor < MIN_FRAGMENT_SECONDS
        {
            continue;
        }
        intervals[i].end = anchor;
        intervals[i + 1].start = anchor;
    }
}

/// Build intervals from provider chapters: clamp, merge chapters shorter
/// than `min_seg` into their successor, and subdivide chapters longer
/// than `max_seg` into equal slices.
fn chapter_intervals(
    chapters: &[ChapterSpan],
    duration: f64,
    rules: &SegmentRules,
) -> Vec<DraftInterval> {
    let mut normalized: Vec<ChapterSpan> = chapters
        .iter()
        .map(|c| ChapterSpan {
            title: c.title.clone(),
            start: c.start.clamp(0.0, duration),
            end: c.end.clamp(0.0, duration),
            importance: c.importance,
        })
        .filter(|c| c.end - c.start >= MIN_FRAGMENT_SECONDS)
        .collect();
    normalized.sort_by(|a, b| a.start.total_cmp(&b.start));

    // No usable chapters: treat the whole source as one chapter.
    if normalized.is_empty() {
        normalized.push(ChapterSpan {
            title: None,
            start: 0.0,
            end: duration,
            importance: 1.0,
        });
    }

    // Merge short chapters forward so nothing is below min_seg.
    let mut merged: Vec<ChapterSpan> = Vec::with_capacity(normalized.len());
    for chapter in normalized {
        match merged.last_mut() {
            Some(last) if last.end - last.start < rules.min_seg => {
                last.end = chapter.end;
                last.importance = last.importance.max(chapter.importance);
            }
            _ => merged.push(chapter),
        }
    }

    // Subdivide long chapters into equal slices within [min_seg, max_seg].
    let mut intervals = Vec::new();
    for chapter in merged {
        let span = chapter.end - chapter.start;
        let pieces = (span / rules.max_seg).ceil().max(1.0) as usize;
        let piece = span / pieces as f64;
        for i in 0..pieces {
            intervals.push(DraftInterval {
                start: chapter.start + piece * i as f64,
                end: chapter.start + piece * (i + 1) as f64,
                importance: chapter.importance,
                narration: None,
                paragraph_hash: None,
            });
        }
    }
    intervals
}

/// Split every interval into fragments no longer than `max_fragment`.
/// Splits are deterministic (equal slices); a preset narration stays with
/// the first fragment and the rest are described individually.
fn short_clip_split(intervals: Vec<DraftInterval>, max_fragment: f64) -> Vec<DraftInterval> {
    let mut fragments = Vec::with_capacity(intervals.len());
    for interval in intervals {
        let span = interval.duration();
        let pieces = (span / max_fragment).ceil().max(1.0) as usize;
        let piece = span / pieces as f64;
        for i in 0..pieces {
            fragments.push(DraftInterval {
                start: interval.start + piece * i as f64,
                end: interval.start + piece * (i + 1) as f64,
                importance: interval.importance,
                narration: if i == 0 { interval.narration.clone() } else { None },
                paragraph_hash: interval.paragraph_hash.clone(),
            });
        }
    }
    fragments
}

/// Greedy selection by importance until cumulative duration reaches
/// `target x overrun_factor`; the remainder is dropped.
fn select_for_target(
    intervals: Vec<DraftInterval>,
    target_seconds: f64,
    overrun_factor: f64,
) -> Vec<DraftInterval> {
    let limit = target_seconds * overrun_factor;

    let mut order: Vec<usize> = (0..intervals.len()).collect();
    order.sort_by(|&a, &b| {
        intervals[b]
            .importance
            .total_cmp(&intervals[a].importance)
            .then(a.cmp(&b))
    });

    let mut selected = vec![false; intervals.len()];
    let mut cumulative = 0.0;
    for index in order {
        if cumulative >= limit {
            break;
        }
        selected[index] = true;
        cumulative += intervals[index].duration();
    }

    intervals
        .into_iter()
        .zip(selected)
        .filter_map(|(interval, keep)| keep.then_some(interval))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use recap_models::{BlobHandle, JobConfig};

    fn job_with(duration: f64, config: JobConfig) -> Job {
        let mut job = Job::new(
            "user-1",
            BlobHandle::new("media", "s.mp4"),
            duration,
            config,
        );
        job.id = JobId::from_string("job-fixed");
        job
    }

    fn rules() -> SegmentRules {
        SegmentRules::default()
    }

    fn limits() -> PlanLimits {
        PlanLimits::default()
    }

    fn chapters_of(spans: &[(f64, f64, f64)]) -> Vec<ChapterSpan> {
        spans
            .iter()
            .map(|&(start, end, importance)| ChapterSpan {
                title: None,
                start,
                end,
                importance,
            })
            .collect()
    }

    fn plan(job: &Job, chapters: Option<&[ChapterSpan]>) -> EngineResult<Vec<Segment>> {
        plan_segments(&PlanContext {
            job,
            chapters,
            rules: &rules(),
            limits: &limits(),
        })
    }

    #[test]
    fn test_plan_is_deterministic() {
        let job = job_with(600.0, JobConfig::default());
        let chapters = chapters_of(&[(0.0, 300.0, 0.5), (300.0, 600.0, 0.9)]);

        let a = plan(&job, Some(&chapters)).unwrap();
        let b = plan(&job, Some(&chapters)).unwrap();

        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.fingerprint, y.fingerprint);
            assert_eq!(x.start, y.start);
            assert_eq!(x.end, y.end);
        }
    }

    #[test]
    fn test_script_paragraphs_become_segments() {
        let config = JobConfig {
            script: Some("One two three.\n\nFour five six seven eight nine.\n\nTen.".into()),
            ..JobConfig::default()
        };
        let job = job_with(100.0, config);
        let segments = plan(&job, None).unwrap();

        assert_eq!(segments.len(), 3);
        assert!(segments.iter().all(|s| s.narration.is_some()));
        // Longer paragraphs get proportionally longer intervals.
        assert!(segments[1].duration() > segments[0].duration());
        // Intervals tile the whole source.
        assert!((segments.last().unwrap().end - 100.0).abs() < 1e-9);
        assert_eq!(segments[0].start, 0.0);
    }

    #[test]
    fn test_script_boundaries_snap_to_chapters() {
        let config = JobConfig {
            // Equal word counts put the pass-1 boundary at 50.0.
            script: Some("alpha beta gamma delta.\n\nepsilon zeta eta theta.".into()),
            ai_segment_matching: true,
            ..JobConfig::default()
        };
        let job = job_with(100.0, config);
        let chapters = chapters_of(&[(0.0, 52.0, 1.0), (52.0, 100.0, 1.0)]);

        let segments = plan(&job, Some(&chapters)).unwrap();
        assert_eq!(segments.len(), 2);
        assert!((segments[0].end - 52.0).abs() < 1e-9);
        assert!((segments[1].start - 52.0).abs() < 1e-9);
    }

    #[test]
    fn test_long_chapter_subdivided() {
        let job = job_with(120.0, JobConfig::default());
        let chapters = chapters_of(&[(0.0, 120.0, 1.0)]);

        let segments = plan(&job, Some(&chapters)).unwrap();
        assert_eq!(segments.len(), 4);
        for segment in &segments {
            assert!(segment.duration() <= rules().max_seg + 1e-9);
            assert!(segment.duration() >= rules().min_seg - 1e-9);
        }
    }

    #[test]
    fn test_short_chapter_merged_forward() {
        let job = job_with(30.0, JobConfig::default());
        let chapters = chapters_of(&[(0.0, 1.0, 0.2), (1.0, 30.0, 0.8)]);

        let segments = plan(&job, Some(&chapters)).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start, 0.0);
        assert_eq!(segments[0].end, 30.0);
        assert_eq!(segments[0].importance, 0.8);
    }

    #[test]
    fn test_no_chapters_falls_back_to_slicing() {
        let job = job_with(65.0, JobConfig::default());
        let segments = plan(&job, Some(&[])).unwrap();
        assert_eq!(segments.len(), 3);
        assert!((segments.last().unwrap().end - 65.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_clip_mode_bounds_fragments() {
        let config = JobConfig {
            short_clip_mode: true,
            ..JobConfig::default()
        };
        let job = job_with(60.0, config);
        let chapters = chapters_of(&[(0.0, 60.0, 1.0)]);

        let segments = plan(&job, Some(&chapters)).unwrap();
        for segment in &segments {
            assert!(segment.duration() <= rules().short_clip_max + 1e-9);
        }
        assert_eq!(segments.len(), 20);
    }

    #[test]
    fn test_short_clip_keeps_narration_on_first_fragment() {
        let config = JobConfig {
            script: Some("only paragraph here".into()),
            short_clip_mode: true,
            ..JobConfig::default()
        };
        let job = job_with(9.0, config);

        let segments = plan(&job, None).unwrap();
        assert_eq!(segments.len(), 3);
        assert!(segments[0].narration.is_some());
        assert!(segments[1].narration.is_none());
        assert!(segments[2].narration.is_none());
    }

    #[test]
    fn test_target_selection_keeps_important_segments() {
        let config = JobConfig {
            target_duration_minutes: Some(1.0),
            ..JobConfig::default()
        };
        let job = job_with(300.0, config);
        // Five 30s chapters at max_seg already; importances differ.
        let chapters = chapters_of(&[
            (0.0, 30.0, 0.1),
            (30.0, 60.0, 0.9),
            (60.0, 90.0, 0.8),
            (90.0, 120.0, 0.2),
            (120.0, 150.0, 0.7),
        ]);

        let segments = plan(&job, Some(&chapters)).unwrap();
        // 60s target x 1.1 = 66s budget: the top three 30s segments are
        // selected (selection stops once the budget is reached).
        assert_eq!(segments.len(), 3);
        let starts: Vec<f64> = segments.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![30.0, 60.0, 120.0]);
        // Indices are dense and ordered by start.
        let indices: Vec<u32> = segments.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_target_longer_than_source_unrealizable() {
        let config = JobConfig {
            target_duration_minutes: Some(1.0),
            ..JobConfig::default()
        };
        let job = job_with(5.0, config);

        let err = plan(&job, Some(&[])).unwrap_err();
        assert!(matches!(err, EngineError::Plan(_)));
    }

    #[test]
    fn test_zero_duration_unrealizable() {
        let job = job_with(0.0, JobConfig::default());
        assert!(matches!(plan(&job, Some(&[])), Err(EngineError::Plan(_))));
    }

    #[test]
    fn test_empty_script_unrealizable() {
        let config = JobConfig {
            script: Some("   \n\n   ".into()),
            ..JobConfig::default()
        };
        let job = job_with(60.0, config);
        assert!(matches!(plan(&job, None), Err(EngineError::Plan(_))));
    }

    #[test]
    fn test_fingerprint_depends_on_script_text() {
        let id = JobId::from_string("job-1");
        let base = segment_fingerprint(&id, 0, 0.0, 10.0, None);
        let with_script = segment_fingerprint(&id, 0, 0.0, 10.0, Some("hash"));
        assert_ne!(base, with_script);
        assert_eq!(base.len(), 64);
    }
}
