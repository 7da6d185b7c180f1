//! The recap job pipeline engine.
//!
//! A stateful, concurrent coordinator that advances each job through its
//! stages, fans out per-segment work under the external call gate, tracks
//! progress, enforces quota, pushes live updates to subscribers, persists
//! durable state, and guarantees exactly-once billing on completion.
//!
//! The engine owns no I/O of its own: the job store, quota ledger, blob
//! gateway and all AI/media providers are injected collaborators built
//! once at process start.

pub mod billing;
pub mod bus;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod planner;
pub mod pool;
pub mod providers;
pub mod remote;
pub mod stitcher;

pub use billing::{sign_notice, verify_notice, BillingSink, LogBillingSink};
pub use bus::ProgressBus;
pub use config::{EngineConfig, PlanLimits, SegmentRules, StageTimeouts};
pub use context::{EngineDeps, JobHandle, ProviderSet};
pub use controller::PipelineController;
pub use error::{EngineError, EngineResult};
pub use providers::{
    provider_ids, AssemblyStep, ChapterProvider, ChapterSpan, DescribeRequest, MediaTranscoder,
    SpeechSynthesizer, SynthesizedAudio, TranscodeOutput, VisualDescriber,
};
