//! Store abstraction for admission state
//!
//! Everything the admission layer asks of the shared store goes through
//! this narrow interface: atomic job transitions, atomic multi-bucket
//! token takes, per-kind counters, retention sweeps. Production runs
//! against `RedisStore`; tests and the degraded-mode overlay run against
//! `MemoryStore`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bucket::{Bucket, BucketParams, TakeResult};
use crate::record::{JobKind, JobOutcome, JobRecord};

/// Store operation errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is unreachable; callers degrade to local state
    #[error("store unreachable: {0}")]
    Connection(String),

    /// The store answered but the operation misbehaved
    #[error("store operation failed: {0}")]
    Backend(String),

    /// A persisted record could not be decoded
    #[error("malformed record {id}: {reason}")]
    Malformed { id: String, reason: String },

    /// Payload serialization failed
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the store itself is unreachable; the trigger for
    /// degraded mode (as opposed to data-level failures, which are not)
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Per-kind job counters: live gauges for the active states, monotonic
/// counters for the terminal ones
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobCounts {
    /// Live active jobs plus every terminal outcome recorded so far
    pub fn total(&self) -> u64 {
        self.queued + self.running + self.completed + self.failed + self.cancelled
    }
}

/// One bucket's share of an atomic multi-bucket take
#[derive(Debug, Clone)]
pub struct BucketTake {
    /// Store key identifying the bucket (e.g. `anthropic:claude:requests`)
    pub key: String,

    /// Bucket sizing; passed down so every process enforces the same shape
    pub params: BucketParams,

    /// Tokens this call consumes from this bucket
    pub cost: f64,
}

/// The shared-store contract
///
/// `claim_next` is the cross-process mutual-exclusion primitive: at most
/// `limit` jobs of a kind run store-wide because the claim transition and
/// the running counter move in one atomic step. `finish_job` takes the kind
/// (the worker knows it) so the slot release needs no extra read;
/// `cancel_job` resolves the kind from the record.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new queued job: record, claim-order index entry, queued
    /// gauge, all atomically
    async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError>;

    /// Fetch one record
    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Atomically claim the best queued job of `kind` (lowest band, then
    /// earliest enqueue) if fewer than `limit` are running store-wide
    async fn claim_next(&self, kind: JobKind, limit: u32) -> Result<Option<JobRecord>, StoreError>;

    /// Record a terminal outcome for a running job and release its slot.
    /// Returns false without writing when the record is not running; a
    /// record that lapsed out of retention mid-run has no fields left to
    /// write but its worker still held a slot, so that one is released.
    async fn finish_job(&self, id: &str, kind: JobKind, outcome: &JobOutcome) -> Result<bool, StoreError>;

    /// Atomic queued-to-cancelled transition; running, terminal, and
    /// unknown jobs return false untouched
    async fn cancel_job(&self, id: &str) -> Result<bool, StoreError>;

    /// Current counters for one kind
    async fn counts(&self, kind: JobKind) -> Result<JobCounts, StoreError>;

    /// Refill-check-decrement across every listed bucket, all-or-nothing.
    /// On denial no bucket is decremented and the worst wait is reported.
    async fn take_tokens(&self, takes: &[BucketTake]) -> Result<TakeResult, StoreError>;

    /// Read-only bucket level for operator tooling
    async fn peek_bucket(&self, key: &str) -> Result<Option<Bucket>, StoreError>;

    /// Drop records past their retention deadline; returns how many went
    async fn purge_expired(&self) -> Result<u64, StoreError>;

    /// Cheap health probe, used to detect recovery from degraded mode
    async fn ping(&self) -> Result<(), StoreError>;
}
