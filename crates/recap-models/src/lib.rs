//! Shared data models for the recap pipeline engine.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, their lifecycle stages and patches
//! - Narration segments and their fingerprints
//! - Progress events and live-subscription messages
//! - Quota accounts, top-up credits and usage records
//! - Error kinds shared across the pipeline

pub mod blob;
pub mod job;
pub mod outcome;
pub mod progress;
pub mod quota;
pub mod segment;
pub mod ws;

// Re-export common types
pub use blob::BlobHandle;
pub use job::{Job, JobConfig, JobId, JobLease, JobPatch, JobSnapshot, JobStage};
pub use outcome::{ErrorKind, TerminalError, TerminalOutcome};
pub use progress::ProgressEvent;
pub use quota::{
    current_billing_period, BillingNotice, QuotaAccount, QuotaSnapshot, TopUpCredit, UsageRecord,
};
pub use segment::{Segment, SegmentStatus};
pub use ws::WsEvent;
