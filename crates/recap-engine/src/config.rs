//! Engine configuration.
//!
//! Read once at startup; hot reload is not supported.

use std::collections::HashMap;
use std::time::Duration;

use recap_gate::ProviderConfig;

use crate::providers::provider_ids;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Segment planning and alignment rules.
#[derive(Debug, Clone)]
pub struct SegmentRules {
    /// Minimum segment duration in seconds
    pub min_seg: f64,
    /// Maximum segment duration in seconds
    pub max_seg: f64,
    /// Fragment ceiling in short-clip mode
    pub short_clip_max: f64,
    /// Lower clamp for the stitch speed factor
    pub speed_min: f64,
    /// Upper clamp for the stitch speed factor
    pub speed_max: f64,
    /// How far a script boundary may move to meet a chapter boundary
    pub snap_tolerance: f64,
    /// Narration pacing used to derive per-segment word budgets
    pub words_per_second: f64,
}

impl Default for SegmentRules {
    fn default() -> Self {
        Self {
            min_seg: 2.0,
            max_seg: 30.0,
            short_clip_max: 3.0,
            speed_min: 0.5,
            speed_max: 2.0,
            snap_tolerance: 5.0,
            words_per_second: 2.5,
        }
    }
}

/// Whole-stage time budgets.
#[derive(Debug, Clone)]
pub struct StageTimeouts {
    pub segment_processing: Duration,
    pub stitching: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            segment_processing: Duration::from_secs(20 * 60),
            stitching: Duration::from_secs(10 * 60),
        }
    }
}

/// Target-duration selection limits.
#[derive(Debug, Clone)]
pub struct PlanLimits {
    /// Selection stops once cumulative duration reaches target x this factor
    pub target_overrun_factor: f64,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            target_overrun_factor: 1.10,
        }
    }
}

/// Process-wide engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Parallel segment workers per job (P)
    pub worker_concurrency_per_job: usize,
    /// Maximum active jobs per process
    pub max_concurrent_jobs: usize,
    /// Lease duration; renewed every third of this
    pub lease_seconds: u64,
    /// Poll interval when the pending queue is empty
    pub claim_poll_interval: Duration,
    /// Interval of the crash-recovery sweep
    pub recovery_interval: Duration,
    /// How many segment failures a job tolerates before failing
    pub segment_failure_tolerance: u32,
    /// Bill source-duration minutes instead of output minutes
    pub bill_source_minutes: bool,
    /// HMAC key for signed billing completion notices
    pub billing_secret: String,
    pub segment: SegmentRules,
    pub stage_timeouts: StageTimeouts,
    pub plan_limits: PlanLimits,
    /// Per-provider throttling and retry policy
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency_per_job: 4,
            max_concurrent_jobs: 32,
            lease_seconds: 60,
            claim_poll_interval: Duration::from_millis(500),
            recovery_interval: Duration::from_secs(30),
            segment_failure_tolerance: 0,
            bill_source_minutes: false,
            billing_secret: "dev-billing-secret".to_string(),
            segment: SegmentRules::default(),
            stage_timeouts: StageTimeouts::default(),
            plan_limits: PlanLimits::default(),
            providers: default_providers(),
        }
    }
}

/// Default gate policy per provider. External AI services here quote
/// 1-10 req/s; the transcoder and blob store tolerate more.
fn default_providers() -> HashMap<String, ProviderConfig> {
    let mut providers = HashMap::new();
    providers.insert(
        provider_ids::CHAPTERS.to_string(),
        ProviderConfig {
            rps: 2,
            max_in_flight: 2,
            per_attempt_timeout: Duration::from_secs(120),
            ..ProviderConfig::default()
        },
    );
    providers.insert(
        provider_ids::VISION.to_string(),
        ProviderConfig {
            rps: 5,
            max_in_flight: 8,
            per_attempt_timeout: Duration::from_secs(90),
            ..ProviderConfig::default()
        },
    );
    providers.insert(
        provider_ids::TTS.to_string(),
        ProviderConfig {
            rps: 10,
            max_in_flight: 8,
            per_attempt_timeout: Duration::from_secs(60),
            ..ProviderConfig::default()
        },
    );
    providers.insert(
        provider_ids::BLOB.to_string(),
        ProviderConfig {
            rps: 50,
            max_in_flight: 16,
            per_attempt_timeout: Duration::from_secs(60),
            ..ProviderConfig::default()
        },
    );
    providers
}

impl EngineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut providers = defaults.providers;
        for (id, config) in providers.iter_mut() {
            let prefix = format!("PROVIDER_{}", id.to_uppercase());
            config.rps = env_parse(&format!("{prefix}_RPS"), config.rps);
            config.max_in_flight = env_parse(&format!("{prefix}_MAX_IN_FLIGHT"), config.max_in_flight);
            config.max_attempts = env_parse(&format!("{prefix}_MAX_ATTEMPTS"), config.max_attempts);
            config.per_attempt_timeout = Duration::from_secs(env_parse(
                &format!("{prefix}_TIMEOUT_SECS"),
                config.per_attempt_timeout.as_secs(),
            ));
        }

        Self {
            worker_concurrency_per_job: env_parse(
                "ENGINE_WORKERS_PER_JOB",
                defaults.worker_concurrency_per_job,
            ),
            max_concurrent_jobs: env_parse("ENGINE_MAX_JOBS", defaults.max_concurrent_jobs),
            lease_seconds: env_parse("ENGINE_LEASE_SECS", defaults.lease_seconds),
            claim_poll_interval: Duration::from_millis(env_parse(
                "ENGINE_CLAIM_POLL_MS",
                defaults.claim_poll_interval.as_millis() as u64,
            )),
            recovery_interval: Duration::from_secs(env_parse(
                "ENGINE_RECOVERY_INTERVAL_SECS",
                defaults.recovery_interval.as_secs(),
            )),
            segment_failure_tolerance: env_parse(
                "ENGINE_SEGMENT_FAILURE_TOLERANCE",
                defaults.segment_failure_tolerance,
            ),
            bill_source_minutes: env_parse("ENGINE_BILL_SOURCE_MINUTES", false),
            billing_secret: std::env::var("BILLING_SIGNING_SECRET")
                .unwrap_or(defaults.billing_secret),
            segment: SegmentRules {
                min_seg: env_parse("SEGMENT_MIN_SECS", defaults.segment.min_seg),
                max_seg: env_parse("SEGMENT_MAX_SECS", defaults.segment.max_seg),
                short_clip_max: env_parse("SEGMENT_SHORT_CLIP_MAX_SECS", defaults.segment.short_clip_max),
                speed_min: env_parse("SEGMENT_SPEED_MIN", defaults.segment.speed_min),
                speed_max: env_parse("SEGMENT_SPEED_MAX", defaults.segment.speed_max),
                snap_tolerance: env_parse("SEGMENT_SNAP_TOLERANCE_SECS", defaults.segment.snap_tolerance),
                words_per_second: env_parse("SEGMENT_WORDS_PER_SECOND", defaults.segment.words_per_second),
            },
            stage_timeouts: StageTimeouts {
                segment_processing: Duration::from_secs(env_parse(
                    "STAGE_TIMEOUT_SEGMENTS_SECS",
                    defaults.stage_timeouts.segment_processing.as_secs(),
                )),
                stitching: Duration::from_secs(env_parse(
                    "STAGE_TIMEOUT_STITCHING_SECS",
                    defaults.stage_timeouts.stitching.as_secs(),
                )),
            },
            plan_limits: PlanLimits {
                target_overrun_factor: env_parse(
                    "PLAN_TARGET_OVERRUN_FACTOR",
                    defaults.plan_limits.target_overrun_factor,
                ),
            },
            providers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_concurrency_per_job, 4);
        assert_eq!(config.max_concurrent_jobs, 32);
        assert_eq!(config.lease_seconds, 60);
        assert_eq!(config.segment_failure_tolerance, 0);
        assert_eq!(config.plan_limits.target_overrun_factor, 1.10);
        assert!(config.providers.contains_key(provider_ids::TTS));
    }

    #[test]
    fn test_stage_timeout_defaults() {
        let timeouts = StageTimeouts::default();
        assert_eq!(timeouts.segment_processing, Duration::from_secs(1200));
        assert_eq!(timeouts.stitching, Duration::from_secs(600));
    }
}
