//! Durable state for the recap pipeline engine.
//!
//! Two traits live here, each with an in-memory backend (tests,
//! single-process deployments) and a Redis backend (production):
//!
//! - [`JobStore`]: jobs, their segments, leases and optimistic-concurrency
//!   updates. Claiming sets a time-bounded lease; jobs whose lease expires
//!   while non-terminal are crash-recoverable.
//! - [`QuotaLedger`]: per-user minutes with atomic reservation, exactly-once
//!   commit anchored on the `(job, billing_period)` usage record, and
//!   idempotent top-ups.

pub mod error;
pub mod job;
pub mod ledger;
pub mod memory;
pub mod redis_backend;

pub use error::{StoreError, StoreResult};
pub use job::{apply_patch, JobStore};
pub use ledger::{QuotaLedger, Reservation};
pub use memory::{MemoryJobStore, MemoryLedger};
pub use redis_backend::{RedisJobStore, RedisLedger, RedisStoreConfig};
