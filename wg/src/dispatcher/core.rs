//! Dispatcher implementation

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::limiter::{DistributedLimiter, LocalLimiter, QuotaKey};

use super::config::DispatcherConfig;

/// How a client error tells the dispatcher to slow down
///
/// Implemented by the error type of whatever client the dispatched call
/// uses, so the dispatcher can tell throttle rejections from real
/// failures without knowing the client.
pub trait RateLimitSignal {
    /// True when the upstream rejected the call for rate reasons
    fn is_rate_limit(&self) -> bool;

    /// Server-advised pause, when the rejection carried one
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Terminal dispatch failures
#[derive(Debug, Error)]
pub enum DispatchError<E> {
    /// Admission never opened within the attempt budget
    #[error("admission saturated after {attempts} attempts ({waited_ms}ms waited)")]
    Saturated { attempts: u32, waited_ms: u64 },

    /// The upstream kept rate limiting through the whole attempt budget
    #[error("upstream rate limited through {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// The call failed with an error that is not a rate limit
    #[error("{0}")]
    Call(E),
}

/// Throughput counters for one dispatcher
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatcherStats {
    /// Dispatches that returned a result to the caller
    pub total_processed: u64,

    /// Dispatches that ended in a terminal error
    pub total_failed: u64,

    /// Upstream rate-limit rejections observed
    pub total_rate_limited: u64,

    /// Milliseconds spent sleeping on denials and backoff
    pub total_wait_ms: u64,

    /// High-water mark of simultaneous in-flight calls
    pub peak_in_flight: usize,
}

/// Paces and meters every outbound call from this process
///
/// Three gates run before the call itself: the in-flight ceiling, the
/// distributed reservation (with the process-local bucket as a final
/// check behind it), and minimum spacing between call starts. Denials
/// sleep for the advised wait, escalating to jittered exponential
/// backoff when denied repeatedly or when the upstream itself answers
/// with a rate limit.
pub struct Dispatcher {
    config: DispatcherConfig,
    limiter: Arc<DistributedLimiter>,
    local_gate: LocalLimiter,
    slots: Semaphore,
    next_start: Mutex<Option<Instant>>,
    stats: Mutex<DispatcherStats>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, limiter: Arc<DistributedLimiter>) -> Self {
        debug!(?config, "Dispatcher::new: called");
        Self {
            local_gate: LocalLimiter::new(limiter.quotas().clone()),
            slots: Semaphore::new(config.max_in_flight),
            next_start: Mutex::new(None),
            stats: Mutex::new(DispatcherStats::default()),
            config,
            limiter,
        }
    }

    /// Run one upstream call through admission
    ///
    /// `call` is invoked once per attempt; it may run more than once when
    /// the upstream rate limits. Returns the call's own error unchanged
    /// when it fails for non-rate reasons.
    pub async fn dispatch<T, E, F, Fut>(&self, key: &QuotaKey, tokens: f64, mut call: F) -> Result<T, DispatchError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RateLimitSignal,
    {
        debug!(key = %key, tokens, "Dispatcher::dispatch: called");
        let mut attempt: u32 = 0;
        let mut denials: u32 = 0;
        let mut backoff = self.config.base_backoff();
        let mut waited = Duration::ZERO;

        loop {
            attempt += 1;

            // Reservation: the shared buckets first, then the process-local
            // bucket as the final gate against a burst of our own making
            let reservation = self.limiter.try_reserve(key, tokens).await;
            let denied_wait = if reservation.granted {
                let local = self.local_gate.reserve(key, tokens).await;
                (!local.granted).then(|| Duration::from_millis(local.wait_ms))
            } else {
                Some(reservation.wait)
            };

            if let Some(advised) = denied_wait {
                if attempt >= self.config.max_attempts {
                    self.note_failure(waited).await;
                    warn!(key = %key, attempts = attempt, "Dispatcher::dispatch: giving up, admission saturated");
                    return Err(DispatchError::Saturated {
                        attempts: attempt,
                        waited_ms: waited.as_millis() as u64,
                    });
                }
                denials += 1;
                let pause = if denials == 1 && advised <= self.config.max_limiter_wait() {
                    advised
                } else {
                    self.next_backoff(&mut backoff)
                };
                debug!(
                    key = %key,
                    attempt,
                    pause_ms = pause.as_millis() as u64,
                    "Dispatcher::dispatch: admission denied, waiting"
                );
                tokio::time::sleep(pause).await;
                waited += pause;
                continue;
            }

            // In-flight ceiling; waiting here is the local dispatch queue
            let permit = match self.slots.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    // The semaphore is never closed while the dispatcher
                    // lives; a closed one means shutdown, answer saturated
                    self.note_failure(waited).await;
                    return Err(DispatchError::Saturated {
                        attempts: attempt,
                        waited_ms: waited.as_millis() as u64,
                    });
                }
            };

            // Minimum spacing between consecutive call starts
            self.pace().await;

            {
                let mut stats = self.stats.lock().await;
                let in_flight = self.config.max_in_flight - self.slots.available_permits();
                stats.peak_in_flight = stats.peak_in_flight.max(in_flight);
            }

            let result = call().await;
            drop(permit);

            match result {
                Ok(value) => {
                    let mut stats = self.stats.lock().await;
                    stats.total_processed += 1;
                    stats.total_wait_ms += waited.as_millis() as u64;
                    debug!(key = %key, attempt, "Dispatcher::dispatch: succeeded");
                    return Ok(value);
                }
                Err(e) if e.is_rate_limit() => {
                    {
                        let mut stats = self.stats.lock().await;
                        stats.total_rate_limited += 1;
                    }
                    if attempt >= self.config.max_attempts {
                        self.note_failure(waited).await;
                        warn!(key = %key, attempts = attempt, "Dispatcher::dispatch: upstream kept rate limiting");
                        return Err(DispatchError::Exhausted { attempts: attempt });
                    }
                    let pause = match e.retry_after() {
                        Some(advice) => advice,
                        None => self.next_backoff(&mut backoff),
                    };
                    warn!(
                        key = %key,
                        attempt,
                        pause_ms = pause.as_millis() as u64,
                        "Dispatcher::dispatch: upstream rate limited, backing off"
                    );
                    tokio::time::sleep(pause).await;
                    waited += pause;
                }
                Err(e) => {
                    self.note_failure(waited).await;
                    return Err(DispatchError::Call(e));
                }
            }
        }
    }

    /// Get the dispatcher statistics
    pub async fn stats(&self) -> DispatcherStats {
        self.stats.lock().await.clone()
    }

    /// Hold each caller until its start slot; slots are spaced
    /// `min_spacing` apart regardless of how callers bunch up
    async fn pace(&self) {
        let spacing = self.config.min_spacing();
        if spacing.is_zero() {
            return;
        }
        let wake = {
            let mut next_start = self.next_start.lock().await;
            let now = Instant::now();
            let wake = match *next_start {
                Some(at) if at > now => at,
                _ => now,
            };
            *next_start = Some(wake + spacing);
            wake
        };
        tokio::time::sleep_until(wake).await;
    }

    fn next_backoff(&self, backoff: &mut Duration) -> Duration {
        let pause = backoff.mul_f64(rand::rng().random_range(0.5..1.5));
        *backoff = (*backoff * 2).min(self.config.max_backoff());
        pause
    }

    async fn note_failure(&self, waited: Duration) {
        let mut stats = self.stats.lock().await;
        stats.total_failed += 1;
        stats.total_wait_ms += waited.as_millis() as u64;
    }
}
