//! Injected collaborators and per-job state handle.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use recap_blob::BlobStore;
use recap_gate::CallGate;
use recap_models::{Job, JobId, JobPatch, ProgressEvent};
use recap_store::{JobStore, QuotaLedger, StoreError};

use crate::bus::ProgressBus;
use crate::billing::BillingSink;
use crate::error::{EngineError, EngineResult};
use crate::providers::{ChapterProvider, MediaTranscoder, SpeechSynthesizer, VisualDescriber};

/// Retries when a concurrent writer bumps the job revision under us.
const MAX_PATCH_RETRIES: u32 = 5;

/// The external AI services and the transcoder, behind their traits.
pub struct ProviderSet {
    pub chapters: Arc<dyn ChapterProvider>,
    pub describer: Arc<dyn VisualDescriber>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub transcoder: Arc<dyn MediaTranscoder>,
    pub billing: Arc<dyn BillingSink>,
}

/// Everything the engine talks to, built once at process start.
pub struct EngineDeps {
    pub store: Arc<dyn JobStore>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub blobs: Arc<dyn BlobStore>,
    pub gate: Arc<CallGate>,
    pub bus: Arc<ProgressBus>,
    pub providers: ProviderSet,
}

/// Shared handle to one in-flight job.
///
/// Serializes store patches from the controller and the segment workers
/// through a single cached copy, retrying on revision conflicts, and
/// pairs every update with a progress event whose sequence is persisted
/// as the job's high-water mark.
pub struct JobHandle {
    deps: Arc<EngineDeps>,
    job: Mutex<Job>,
}

impl JobHandle {
    pub fn new(deps: Arc<EngineDeps>, job: Job) -> Self {
        deps.bus.ensure(&job.id, job.event_seq);
        Self {
            deps,
            job: Mutex::new(job),
        }
    }

    pub async fn job_id(&self) -> JobId {
        self.job.lock().await.id.clone()
    }

    /// Clone of the cached job state.
    pub async fn job(&self) -> Job {
        self.job.lock().await.clone()
    }

    /// Re-read the job from the store, refreshing the cache.
    pub async fn refresh(&self) -> EngineResult<Job> {
        let mut guard = self.job.lock().await;
        let fresh = self.deps.store.get(&guard.id).await?;
        *guard = fresh.clone();
        Ok(fresh)
    }

    /// Apply a patch under optimistic concurrency, retrying on conflicts.
    pub async fn patch(&self, patch: JobPatch) -> EngineResult<Job> {
        let mut guard = self.job.lock().await;
        self.apply(&mut guard, patch).await
    }

    /// Apply a patch and publish the resulting progress event.
    ///
    /// Sequence allocation, the store write and the publish happen under
    /// one lock so events from concurrent segment workers are delivered
    /// in sequence order.
    pub async fn patch_and_publish(&self, patch: JobPatch) -> EngineResult<ProgressEvent> {
        let mut guard = self.job.lock().await;
        let sequence = self.deps.bus.next_seq(&guard.id);
        let job = self.apply(&mut guard, patch.with_event_seq(sequence)).await?;

        let event = ProgressEvent::from_job(&job, sequence);
        self.deps.bus.publish(event.clone());
        Ok(event)
    }

    async fn apply(&self, guard: &mut Job, patch: JobPatch) -> EngineResult<Job> {
        for attempt in 0..MAX_PATCH_RETRIES {
            match self
                .deps
                .store
                .update(&guard.id, guard.revision, patch.clone())
                .await
            {
                Ok(updated) => {
                    *guard = updated.clone();
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() => {
                    debug!(job_id = %guard.id, attempt = attempt + 1, "Patch conflict, re-reading");
                    *guard = self.deps.store.get(&guard.id).await?;
                }
                Err(StoreError::TerminalJob(_)) => {
                    // A concurrent writer finished the job; treat as cancelled
                    // so the caller unwinds without a second terminal write.
                    *guard = self.deps.store.get(&guard.id).await?;
                    return Err(EngineError::Cancelled);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::internal(format!(
            "job {} patch contention exhausted",
            guard.id
        )))
    }
}
