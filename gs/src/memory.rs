//! In-memory store implementation
//!
//! The full store contract over process-local state. Backs the test suite,
//! and is embedded by the work queue as the overlay that keeps a process
//! serving while the shared store is down. Claim ordering, counters, and
//! slot-release rules mirror the Redis implementation exactly.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::bucket::{Bucket, TakeResult, wait_ms_for};
use crate::record::{JobKind, JobOutcome, JobRecord, JobState, now_ms};
use crate::store::{BucketTake, JobCounts, Store, StoreError};

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<String, JobRecord>,
    counts: HashMap<JobKind, JobCounts>,
    buckets: HashMap<String, Bucket>,
}

/// Process-local store
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    /// Deposit a record that already carries a terminal state.
    ///
    /// Bypasses the claim path entirely: no queued gauge, no running slot,
    /// only the matching terminal counter. Used for outcomes that could not
    /// reach the primary store, so status reads keep working locally.
    pub async fn record_terminal(&self, job: &JobRecord) {
        let mut inner = self.inner.lock().await;
        debug!(id = %job.id, kind = %job.kind, state = %job.state, "MemoryStore::record_terminal: deposited");
        let counts = inner.counts.entry(job.kind).or_default();
        match job.state {
            JobState::Completed => counts.completed += 1,
            JobState::Failed => counts.failed += 1,
            JobState::Cancelled => counts.cancelled += 1,
            JobState::Queued | JobState::Running => {}
        }
        inner.jobs.insert(job.id.clone(), job.clone());
    }

    /// Drain every still-queued record, fixing the queued gauges.
    ///
    /// Used once per outage recovery: jobs enqueued against the overlay are
    /// handed back for replay into the primary, in claim order so replay
    /// preserves fairness.
    pub async fn take_queued(&self) -> Vec<JobRecord> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<String> = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Queued)
            .map(|j| j.id.clone())
            .collect();

        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = inner.jobs.remove(&id) {
                let counts = inner.counts.entry(job.kind).or_default();
                counts.queued = counts.queued.saturating_sub(1);
                drained.push(job);
            }
        }
        drained.sort_by(|a, b| {
            (a.priority, a.created_at, &a.id).cmp(&(b.priority, b.created_at, &b.id))
        });
        debug!(count = drained.len(), "MemoryStore::take_queued: drained");
        drained
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        debug!(id = %job.id, kind = %job.kind, priority = %job.priority, "MemoryStore::put_job: stored");
        inner.counts.entry(job.kind).or_default().queued += 1;
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        let inner = self.inner.lock().await;
        // Records past retention are invisible before the sweep drops
        // them, the same way key expiry hides them in Redis
        Ok(inner.jobs.get(id).filter(|j| !j.is_expired(now_ms())).cloned())
    }

    async fn claim_next(&self, kind: JobKind, limit: u32) -> Result<Option<JobRecord>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = now_ms();

        // Queued records past retention are ghosts: drop them instead of
        // handing them to a worker (mirrors the Redis claim script)
        let expired: Vec<String> = inner
            .jobs
            .values()
            .filter(|j| j.kind == kind && j.state == JobState::Queued && j.is_expired(now))
            .map(|j| j.id.clone())
            .collect();
        for id in expired {
            debug!(%id, %kind, "MemoryStore::claim_next: dropping expired queued job");
            inner.jobs.remove(&id);
            let counts = inner.counts.entry(kind).or_default();
            counts.queued = counts.queued.saturating_sub(1);
        }

        let running = inner.counts.entry(kind).or_default().running;
        if running >= limit as u64 {
            debug!(%kind, running, limit, "MemoryStore::claim_next: ceiling reached");
            return Ok(None);
        }

        let best = inner
            .jobs
            .values()
            .filter(|j| j.kind == kind && j.state == JobState::Queued)
            .min_by(|a, b| (a.priority, a.created_at, &a.id).cmp(&(b.priority, b.created_at, &b.id)))
            .map(|j| j.id.clone());

        let Some(id) = best else {
            return Ok(None);
        };

        let claimed = match inner.jobs.get_mut(&id) {
            Some(job) => {
                job.start(now);
                job.clone()
            }
            None => return Ok(None),
        };
        let counts = inner.counts.entry(kind).or_default();
        counts.queued = counts.queued.saturating_sub(1);
        counts.running += 1;
        debug!(%id, %kind, running = counts.running, "MemoryStore::claim_next: claimed");
        Ok(Some(claimed))
    }

    async fn finish_job(&self, id: &str, kind: JobKind, outcome: &JobOutcome) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = now_ms();

        let wrote = match inner.jobs.get_mut(id) {
            Some(job) if job.state == JobState::Running => {
                job.finish(outcome, now);
                true
            }
            Some(_) => {
                // Not running: nothing to write and no slot to give back
                debug!(%id, %kind, "MemoryStore::finish_job: job not running");
                return Ok(false);
            }
            // Record purged mid-run; the worker still held a real slot
            None => false,
        };

        let counts = inner.counts.entry(kind).or_default();
        counts.running = counts.running.saturating_sub(1);
        if wrote {
            match outcome {
                JobOutcome::Completed(_) => counts.completed += 1,
                JobOutcome::Failed(_) => counts.failed += 1,
            }
        }
        debug!(%id, %kind, wrote, "MemoryStore::finish_job: slot released");
        Ok(wrote)
    }

    async fn cancel_job(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = now_ms();

        let kind = match inner.jobs.get_mut(id) {
            Some(job) if job.state == JobState::Queued => {
                job.cancel(now);
                job.kind
            }
            _ => {
                debug!(%id, "MemoryStore::cancel_job: not cancellable");
                return Ok(false);
            }
        };
        let counts = inner.counts.entry(kind).or_default();
        counts.queued = counts.queued.saturating_sub(1);
        counts.cancelled += 1;
        debug!(%id, %kind, "MemoryStore::cancel_job: cancelled");
        Ok(true)
    }

    async fn counts(&self, kind: JobKind) -> Result<JobCounts, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.counts.get(&kind).copied().unwrap_or_default())
    }

    async fn take_tokens(&self, takes: &[BucketTake]) -> Result<TakeResult, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = now_ms();

        // Two phases so the take is all-or-nothing: refill and check every
        // bucket first, then commit
        let mut refreshed: Vec<Bucket> = Vec::with_capacity(takes.len());
        let mut granted = true;
        let mut wait_ms = 0u64;
        for take in takes {
            let mut bucket = inner
                .buckets
                .get(&take.key)
                .copied()
                .unwrap_or_else(|| Bucket::full(&take.params, now));
            bucket.refill(&take.params, now);
            if !bucket.covers(take.cost) {
                granted = false;
                wait_ms = wait_ms.max(wait_ms_for(take.cost - bucket.tokens, take.params.refill_per_sec));
            }
            refreshed.push(bucket);
        }

        for (take, mut bucket) in takes.iter().zip(refreshed) {
            if granted {
                bucket.tokens = (bucket.tokens - take.cost).max(0.0);
            }
            inner.buckets.insert(take.key.clone(), bucket);
        }
        debug!(buckets = takes.len(), granted, wait_ms, "MemoryStore::take_tokens");
        Ok(if granted {
            TakeResult::granted()
        } else {
            TakeResult::denied(wait_ms)
        })
    }

    async fn peek_bucket(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.buckets.get(key).copied())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = now_ms();

        let expired: Vec<(String, JobKind, JobState)> = inner
            .jobs
            .values()
            .filter(|j| j.is_expired(now))
            .map(|j| (j.id.clone(), j.kind, j.state))
            .collect();

        let purged = expired.len() as u64;
        for (id, kind, state) in expired {
            inner.jobs.remove(&id);
            // Queued gauge tracks live records; terminal counters are
            // monotonic and a still-running job's slot is released by its
            // worker's finish, so only the queued gauge moves here
            if state == JobState::Queued {
                let counts = inner.counts.entry(kind).or_default();
                counts.queued = counts.queued.saturating_sub(1);
            }
        }
        if purged > 0 {
            debug!(purged, "MemoryStore::purge_expired: records dropped");
        }
        Ok(purged)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
