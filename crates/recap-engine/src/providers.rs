//! Provider traits at the engine's seams.
//!
//! The engine sees external AI services and the media transcoder as
//! opaque request/response calls; prompts, voices and model choices live
//! behind these traits. All implementations are injected at process start.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use recap_gate::CallError;
use recap_models::BlobHandle;

/// Gate provider ids. Requests to different providers never serialize
/// against each other.
pub mod provider_ids {
    /// Chapter service (coarse story structure)
    pub const CHAPTERS: &str = "chapters";
    /// Visual-understanding service (narration text)
    pub const VISION: &str = "vision";
    /// Text-to-speech service
    pub const TTS: &str = "tts";
    /// Blob store reads and writes
    pub const BLOB: &str = "blob";
}

/// One coarse chapter returned by the chapter service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterSpan {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Start in seconds
    pub start: f64,
    /// End in seconds
    pub end: f64,
    /// Selection weight; higher survives target-duration trimming longer
    #[serde(default = "default_importance")]
    pub importance: f64,
}

fn default_importance() -> f64 {
    1.0
}

/// Coarse story structure for a source video.
#[async_trait]
pub trait ChapterProvider: Send + Sync {
    async fn chapters(
        &self,
        source: &BlobHandle,
        duration_seconds: f64,
    ) -> Result<Vec<ChapterSpan>, CallError>;
}

/// A narration request for one segment's time range.
#[derive(Debug, Clone, Serialize)]
pub struct DescribeRequest<'a> {
    pub source: &'a BlobHandle,
    pub start: f64,
    pub end: f64,
    /// Clamp the narration to roughly this many words
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_words: Option<u32>,
    /// Character name guide, when the owner supplied one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_guide: Option<&'a str>,
    /// Series identifier for cross-episode character persistence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_id: Option<&'a str>,
}

/// Visual-understanding service producing narration text.
#[async_trait]
pub trait VisualDescriber: Send + Sync {
    async fn describe(&self, request: DescribeRequest<'_>) -> Result<String, CallError>;
}

/// Synthesized narration audio with its measured duration.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub audio: Vec<u8>,
    pub content_type: String,
    pub duration_seconds: f64,
}

/// Text-to-speech service.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, CallError>;
}

/// One entry of the assembly plan handed to the transcoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyStep {
    /// Source interval start, seconds
    pub start: f64,
    /// Source interval end, seconds
    pub end: f64,
    /// Narration audio for this interval
    pub audio: BlobHandle,
    /// Playback speed applied to the video so it matches the audio
    pub speed_factor: f64,
}

/// Result of a transcoder run.
#[derive(Debug, Clone)]
pub struct TranscodeOutput {
    pub output: BlobHandle,
    pub duration_seconds: f64,
}

/// Media transcoder sub-process. All muxing, encoding and re-timing is
/// delegated here; a stable assembly plan makes reruns idempotent.
#[async_trait]
pub trait MediaTranscoder: Send + Sync {
    async fn assemble(
        &self,
        source: &BlobHandle,
        plan: &[AssemblyStep],
    ) -> Result<TranscodeOutput, CallError>;
}
