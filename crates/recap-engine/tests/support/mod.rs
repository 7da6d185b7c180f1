//! Test harness: in-memory backends plus scripted fake providers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use recap_blob::MemoryBlobStore;
use recap_engine::{
    AssemblyStep, BillingSink, ChapterProvider, ChapterSpan, DescribeRequest, EngineConfig,
    EngineDeps, MediaTranscoder, PipelineController, ProgressBus, ProviderSet,
    SpeechSynthesizer, SynthesizedAudio, TranscodeOutput, VisualDescriber,
};
use recap_gate::{CallError, CallGate};
use recap_models::{BillingNotice, BlobHandle, Job, JobConfig, JobId, JobSnapshot, ProgressEvent};
use recap_store::{JobStore, MemoryJobStore, MemoryLedger, QuotaLedger};

/// Chapter provider returning a scripted chapter list.
#[derive(Default)]
pub struct FakeChapters {
    pub chapters: Mutex<Vec<ChapterSpan>>,
    pub calls: AtomicU32,
}

impl FakeChapters {
    pub fn set(&self, chapters: Vec<ChapterSpan>) {
        *self.chapters.lock().unwrap() = chapters;
    }
}

#[async_trait]
impl ChapterProvider for FakeChapters {
    async fn chapters(
        &self,
        _source: &BlobHandle,
        _duration_seconds: f64,
    ) -> Result<Vec<ChapterSpan>, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.chapters.lock().unwrap().clone())
    }
}

/// Describer producing deterministic narration keyed by the interval start.
#[derive(Default)]
pub struct FakeDescriber {
    pub calls: AtomicU32,
}

#[async_trait]
impl VisualDescriber for FakeDescriber {
    async fn describe(&self, request: DescribeRequest<'_>) -> Result<String, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("Scene at {:.0}s", request.start))
    }
}

/// Synthesizer with an optional per-call delay and scripted transient
/// failures keyed by narration substring.
pub struct FakeSynthesizer {
    pub calls: AtomicU32,
    delay: Mutex<Option<Duration>>,
    flaky: Mutex<HashMap<String, u32>>,
    broken: Mutex<Vec<String>>,
    audio_duration_seconds: Mutex<f64>,
}

impl Default for FakeSynthesizer {
    fn default() -> Self {
        Self {
            calls: AtomicU32::new(0),
            delay: Mutex::new(None),
            flaky: Mutex::new(HashMap::new()),
            broken: Mutex::new(Vec::new()),
            audio_duration_seconds: Mutex::new(5.0),
        }
    }
}

impl FakeSynthesizer {
    /// Fail with a transient error the first `times` calls whose text
    /// contains `substring`.
    pub fn fail_transiently(&self, substring: &str, times: u32) {
        self.flaky
            .lock()
            .unwrap()
            .insert(substring.to_string(), times);
    }

    /// Fail permanently on every call whose text contains `substring`.
    pub fn fail_permanently(&self, substring: &str) {
        self.broken.lock().unwrap().push(substring.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let broken = self.broken.lock().unwrap();
            if broken.iter().any(|s| text.contains(s.as_str())) {
                return Err(CallError::permanent("synthetic TTS outage"));
            }
        }
        {
            let mut flaky = self.flaky.lock().unwrap();
            for (substring, remaining) in flaky.iter_mut() {
                if *remaining > 0 && text.contains(substring.as_str()) {
                    *remaining -= 1;
                    return Err(CallError::transient("synthetic TTS hiccup"));
                }
            }
        }

        Ok(SynthesizedAudio {
            audio: vec![0u8; 16],
            content_type: "audio/mpeg".to_string(),
            duration_seconds: *self.audio_duration_seconds.lock().unwrap(),
        })
    }
}

/// Transcoder returning a fixed output duration, optionally failing the
/// first N calls with a transient error.
pub struct FakeTranscoder {
    pub calls: AtomicU32,
    output_duration_seconds: Mutex<f64>,
    failures_remaining: AtomicU32,
}

impl Default for FakeTranscoder {
    fn default() -> Self {
        Self {
            calls: AtomicU32::new(0),
            output_duration_seconds: Mutex::new(360.0),
            failures_remaining: AtomicU32::new(0),
        }
    }
}

impl FakeTranscoder {
    pub fn fail_next(&self, times: u32) {
        self.failures_remaining.store(times, Ordering::SeqCst);
    }

    pub fn set_output_duration(&self, seconds: f64) {
        *self.output_duration_seconds.lock().unwrap() = seconds;
    }
}

#[async_trait]
impl MediaTranscoder for FakeTranscoder {
    async fn assemble(
        &self,
        _source: &BlobHandle,
        plan: &[AssemblyStep],
    ) -> Result<TranscodeOutput, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(!plan.is_empty(), "assembly plan must not be empty");

        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(CallError::transient("transcoder crashed"));
        }

        Ok(TranscodeOutput {
            output: BlobHandle::new("recap-media", "outputs/recap.mp4"),
            duration_seconds: *self.output_duration_seconds.lock().unwrap(),
        })
    }
}

/// Billing sink capturing every delivered notice.
#[derive(Default)]
pub struct CapturingBillingSink {
    pub notices: Mutex<Vec<(BillingNotice, String)>>,
}

#[async_trait]
impl BillingSink for CapturingBillingSink {
    async fn deliver(&self, notice: &BillingNotice, signed: &str) -> Result<(), CallError> {
        self.notices
            .lock()
            .unwrap()
            .push((notice.clone(), signed.to_string()));
        Ok(())
    }
}

/// Engine config tuned for fast tests: tiny backoffs, quick polling.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.claim_poll_interval = Duration::from_millis(5);
    config.recovery_interval = Duration::from_millis(50);
    for provider in config.providers.values_mut() {
        provider.rps = 10_000;
        provider.base_delay = Duration::from_millis(1);
        provider.max_delay = Duration::from_millis(5);
        provider.per_attempt_timeout = Duration::from_secs(5);
    }
    config
}

/// Everything a scenario test needs, wired over the in-memory backends.
pub struct Harness {
    pub deps: Arc<EngineDeps>,
    pub controller: Arc<PipelineController>,
    pub store: Arc<MemoryJobStore>,
    pub ledger: Arc<MemoryLedger>,
    pub blobs: Arc<MemoryBlobStore>,
    pub chapters: Arc<FakeChapters>,
    pub describer: Arc<FakeDescriber>,
    pub synthesizer: Arc<FakeSynthesizer>,
    pub transcoder: Arc<FakeTranscoder>,
    pub billing: Arc<CapturingBillingSink>,
    pub config: EngineConfig,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let blobs = Arc::new(MemoryBlobStore::new("recap-media"));
        let chapters = Arc::new(FakeChapters::default());
        let describer = Arc::new(FakeDescriber::default());
        let synthesizer = Arc::new(FakeSynthesizer::default());
        let transcoder = Arc::new(FakeTranscoder::default());
        let billing = Arc::new(CapturingBillingSink::default());

        let deps = Arc::new(EngineDeps {
            store: store.clone(),
            ledger: ledger.clone(),
            blobs: blobs.clone(),
            gate: Arc::new(CallGate::new(config.providers.clone())),
            bus: Arc::new(ProgressBus::new()),
            providers: ProviderSet {
                chapters: chapters.clone(),
                describer: describer.clone(),
                synthesizer: synthesizer.clone(),
                transcoder: transcoder.clone(),
                billing: billing.clone(),
            },
        });
        let controller = Arc::new(PipelineController::new(deps.clone(), config.clone()));

        Self {
            deps,
            controller,
            store,
            ledger,
            blobs,
            chapters,
            describer,
            synthesizer,
            transcoder,
            billing,
            config,
            run_task: Mutex::new(None),
        }
    }

    /// Spawn the controller's claim/recovery loop.
    pub fn start(&self) {
        let controller = self.controller.clone();
        let task = tokio::spawn(async move {
            controller.run().await.ok();
        });
        *self.run_task.lock().unwrap() = Some(task);
    }

    pub async fn stop(&self) {
        self.controller.shutdown();
        if let Some(task) = self.run_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Seed a quota account with used minutes through the public ledger API.
    pub async fn seed_account(&self, user_id: &str, limit: f64, used: f64) {
        self.ledger.ensure_account(user_id, limit).await.unwrap();
        if used > 0.0 {
            let seed_job = JobId::from_string(format!("seed-{user_id}"));
            let resv = self
                .ledger
                .reserve(user_id, used, &format!("resv:seed-{user_id}"))
                .await
                .unwrap();
            self.ledger
                .commit(
                    &resv,
                    used,
                    &seed_job,
                    &recap_models::current_billing_period(),
                )
                .await
                .unwrap();
        }
    }

    /// Create a pending job with a seeded source blob.
    pub async fn submit(
        &self,
        owner: &str,
        source_duration_seconds: f64,
        config: JobConfig,
    ) -> JobId {
        let source = self
            .blobs
            .seed("sources/input.mp4", vec![1, 2, 3, 4], "video/mp4")
            .await;
        let job = Job::new(owner, source, source_duration_seconds, config);
        self.store.create(job).await.unwrap()
    }

    /// Poll until the job reaches a terminal stage.
    pub async fn wait_terminal(&self, job_id: &JobId, timeout: Duration) -> JobSnapshot {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self.store.get_snapshot(job_id).await.unwrap();
            if snapshot.is_terminal() {
                return snapshot;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "job {} stuck in {} at {:.0}%",
                    job_id, snapshot.stage, snapshot.progress
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Collect every progress event for a job until the terminal one.
    /// Call before the job starts processing.
    pub fn collect_events(&self, job_id: &JobId) -> JoinHandle<Vec<ProgressEvent>> {
        self.deps.bus.ensure(job_id, 0);
        let (replay, mut live) = self
            .deps
            .bus
            .subscribe(job_id, None)
            .expect("channel just ensured");

        tokio::spawn(async move {
            let mut events = replay;
            if events.last().is_some_and(ProgressEvent::is_terminal) {
                return events;
            }
            loop {
                match live.recv().await {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        events.push(event);
                        if terminal {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            events
        })
    }
}

/// `n` evenly spaced chapters of `len` seconds each, importance 1.0.
pub fn uniform_chapters(n: usize, len: f64) -> Vec<ChapterSpan> {
    (0..n)
        .map(|i| ChapterSpan {
            title: None,
            start: i as f64 * len,
            end: (i + 1) as f64 * len,
            importance: 1.0,
        })
        .collect()
}
