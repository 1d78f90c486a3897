//! Distributed limiter over the shared store, with local fallback
//!
//! Reservations normally go through the shared store so every process
//! spends from the same buckets. When the store is unreachable the limiter
//! flips to degraded mode: reservations are answered from process-local
//! buckets (same quotas, enforced per process), the flag rides on every
//! answer, and a store health event is emitted on each transition. While
//! degraded, one call per probe interval retries the store; the first
//! success flips back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use gatestore::{Store, TakeResult, now_ms};
use tracing::{debug, info, warn};

use crate::events::EventEmitter;

use super::local::LocalLimiter;
use super::quota::{QuotaKey, Quotas};

/// Outcome of a distributed reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// True when every bucket granted and was charged
    pub granted: bool,

    /// On denial, how long until the worst bucket refills
    pub wait: Duration,

    /// True when this answer came from local fallback state rather than
    /// the shared store
    pub degraded: bool,
}

impl Reservation {
    fn from_take(result: TakeResult, degraded: bool) -> Self {
        Self {
            granted: result.granted,
            wait: Duration::from_millis(result.wait_ms),
            degraded,
        }
    }
}

/// Cross-process rate limiter backed by the shared store
pub struct DistributedLimiter {
    store: Arc<dyn Store>,
    fallback: LocalLimiter,
    quotas: Quotas,
    degraded: AtomicBool,
    last_probe_ms: AtomicI64,
    probe_interval: Duration,
    emitter: EventEmitter,
}

impl DistributedLimiter {
    pub fn new(store: Arc<dyn Store>, quotas: Quotas, probe_interval: Duration, emitter: EventEmitter) -> Self {
        Self {
            store,
            fallback: LocalLimiter::new(quotas.clone()),
            quotas,
            degraded: AtomicBool::new(false),
            last_probe_ms: AtomicI64::new(0),
            probe_interval,
            emitter,
        }
    }

    /// Reserve capacity for one upstream call costing `tokens` tokens
    ///
    /// Never fails: when the shared store is unreachable the answer comes
    /// from process-local buckets and is flagged degraded. A key with no
    /// configured quota is admitted without touching any store.
    pub async fn try_reserve(&self, key: &QuotaKey, tokens: f64) -> Reservation {
        let Some(takes) = self.quotas.takes_for(key, tokens) else {
            return Reservation {
                granted: true,
                wait: Duration::ZERO,
                degraded: false,
            };
        };

        if self.is_degraded() && !self.probe_due() {
            let result = self.fallback.reserve(key, tokens).await;
            return Reservation::from_take(result, true);
        }

        // Healthy, or degraded with a probe due: the probe IS the real take
        match self.store.take_tokens(&takes).await {
            Ok(result) => {
                self.mark_recovered();
                debug!(key = %key, granted = result.granted, "DistributedLimiter::try_reserve: store answered");
                Reservation::from_take(result, false)
            }
            Err(e) if e.is_unavailable() => {
                self.mark_degraded(&e.to_string());
                let result = self.fallback.reserve(key, tokens).await;
                Reservation::from_take(result, true)
            }
            Err(e) => {
                // The store answered but the operation failed; answer this
                // call locally without changing mode
                warn!(key = %key, error = %e, "DistributedLimiter::try_reserve: store operation failed");
                let result = self.fallback.reserve(key, tokens).await;
                Reservation::from_take(result, true)
            }
        }
    }

    /// True while reservations are answered from local fallback state
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// The quotas this limiter enforces
    pub fn quotas(&self) -> &Quotas {
        &self.quotas
    }

    /// At most one caller per probe interval wins the right to retry the
    /// store while degraded
    fn probe_due(&self) -> bool {
        let now = now_ms();
        let last = self.last_probe_ms.load(Ordering::Relaxed);
        if now - last < self.probe_interval.as_millis() as i64 {
            return false;
        }
        self.last_probe_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    fn mark_degraded(&self, reason: &str) {
        self.last_probe_ms.store(now_ms(), Ordering::Relaxed);
        if self
            .degraded
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!(reason, "DistributedLimiter: shared store lost, using local buckets");
            self.emitter.store_degraded(reason);
        }
    }

    fn mark_recovered(&self) {
        if self
            .degraded
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("DistributedLimiter: shared store recovered");
            self.emitter.store_recovered();
        }
    }
}
