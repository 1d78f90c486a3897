//! Process-local token bucket limiter

use std::collections::HashMap;

use gatestore::{Bucket, TakeResult, now_ms, wait_ms_for};
use tokio::sync::Mutex;
use tracing::debug;

use super::quota::{QuotaKey, Quotas};

/// In-process rate limiter, one token bucket per configured cap
///
/// Used directly by callers that only need single-process pacing, and by
/// the distributed limiter as its fallback when the shared store is away.
/// A key with no configured quota is always admitted.
pub struct LocalLimiter {
    quotas: Quotas,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl LocalLimiter {
    pub fn new(quotas: Quotas) -> Self {
        Self {
            quotas,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve capacity for one call against every bucket `key` maps to,
    /// all-or-nothing. On denial no bucket is charged and the result
    /// carries how long until the worst deficit refills.
    pub async fn reserve(&self, key: &QuotaKey, tokens: f64) -> TakeResult {
        let Some(takes) = self.quotas.takes_for(key, tokens) else {
            return TakeResult::granted();
        };
        if takes.is_empty() {
            return TakeResult::granted();
        }

        let now = now_ms();
        let mut buckets = self.buckets.lock().await;

        // Refill and check everything before charging anything
        let mut staged = Vec::with_capacity(takes.len());
        let mut granted = true;
        let mut wait_ms = 0u64;
        for take in &takes {
            let mut bucket = buckets
                .get(&take.key)
                .copied()
                .unwrap_or_else(|| Bucket::full(&take.params, now));
            bucket.refill(&take.params, now);
            if !bucket.covers(take.cost) {
                granted = false;
                wait_ms = wait_ms.max(wait_ms_for(take.cost - bucket.tokens, take.params.refill_per_sec));
            }
            staged.push(bucket);
        }

        for (take, mut bucket) in takes.iter().zip(staged) {
            if granted {
                bucket.tokens = (bucket.tokens - take.cost).max(0.0);
            }
            buckets.insert(take.key.clone(), bucket);
        }

        if granted {
            debug!(key = %key, tokens, "LocalLimiter::reserve: granted");
            TakeResult::granted()
        } else {
            debug!(key = %key, tokens, wait_ms, "LocalLimiter::reserve: denied");
            TakeResult::denied(wait_ms)
        }
    }

    /// True when the reservation was granted
    pub async fn try_reserve(&self, key: &QuotaKey, tokens: f64) -> bool {
        self.reserve(key, tokens).await.granted
    }
}
