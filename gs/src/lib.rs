//! GateStore - Shared admission state for WorkGate processes
//!
//! GateStore holds everything WorkGate coordinates across process boundaries:
//! durable job records with their claim indexes, per-kind gauges, and the
//! token buckets behind distributed rate limiting. One [`Store`] trait, two
//! implementations.
//!
//! # Core Concepts
//!
//! - **Atomic Transitions**: Claims, finishes, and cancels are single
//!   server-side steps, so two processes never act on the same job
//! - **All-or-Nothing Takes**: A request spanning several buckets charges
//!   all of them or none
//! - **Soft Failure**: The Redis store connects lazily and reports outages
//!   as [`StoreError::Connection`], so callers can degrade instead of crash
//!
//! # Modules
//!
//! - [`record`] - Job records, kinds, states, priority bands
//! - [`bucket`] - Token bucket math shared by both implementations
//! - [`store`] - The [`Store`] trait and its error type
//! - [`redis`] - Redis-backed implementation (Lua per transition)
//! - [`memory`] - In-process implementation for fallback and tests

pub mod bucket;
pub mod memory;
pub mod record;
pub mod redis;
pub mod store;

// Re-export commonly used types
pub use bucket::{Bucket, BucketParams, TakeResult, wait_ms_for};
pub use memory::MemoryStore;
pub use record::{JobKind, JobOutcome, JobRecord, JobState, Priority, PriorityBands, now_ms};
pub use self::redis::RedisStore;
pub use store::{BucketTake, JobCounts, Store, StoreError};
