//! Token bucket state and refill math
//!
//! One bucket per quota dimension. The same refill/take rules run in the
//! local limiter, the in-memory store, and (as a Lua script against the
//! server clock) the Redis store; they must agree on semantics: refill is
//! proportional to elapsed time, clamped to capacity, and a denied take
//! reports how long until the deficit refills.

use serde::{Deserialize, Serialize};

/// Tolerance for float drift when comparing a level against a cost
const EPSILON: f64 = 1e-9;

/// Static parameters of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketParams {
    /// Maximum token level (burst size)
    pub capacity: f64,

    /// Continuous refill rate in tokens per second
    pub refill_per_sec: f64,
}

impl BucketParams {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    /// Bucket sized from a per-minute quota: burst up to the full minute
    /// allowance, refilled continuously across the minute
    pub fn from_per_minute(limit_per_minute: f64) -> Self {
        Self {
            capacity: limit_per_minute,
            refill_per_sec: limit_per_minute / 60.0,
        }
    }
}

/// Outcome of a take across one or more buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeResult {
    /// True when every bucket covered its cost and was decremented
    pub granted: bool,

    /// On denial, milliseconds until the worst deficit refills
    pub wait_ms: u64,
}

impl TakeResult {
    pub fn granted() -> Self {
        Self {
            granted: true,
            wait_ms: 0,
        }
    }

    pub fn denied(wait_ms: u64) -> Self {
        Self {
            granted: false,
            wait_ms,
        }
    }
}

/// Milliseconds until `deficit` tokens refill at `refill_per_sec`
pub fn wait_ms_for(deficit: f64, refill_per_sec: f64) -> u64 {
    if refill_per_sec <= 0.0 {
        // Nothing ever refills; the caller's wait bound turns this into a
        // terminal denial
        return u64::MAX;
    }
    (deficit / refill_per_sec * 1000.0).ceil() as u64
}

/// Mutable bucket state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    /// Current token level; never negative, never above capacity
    pub tokens: f64,

    /// Last refill timestamp (Unix milliseconds)
    pub refilled_at_ms: i64,
}

impl Bucket {
    /// A bucket starting at full capacity
    pub fn full(params: &BucketParams, now_ms: i64) -> Self {
        Self {
            tokens: params.capacity,
            refilled_at_ms: now_ms,
        }
    }

    /// True when the current level covers `cost` (with float tolerance)
    pub fn covers(&self, cost: f64) -> bool {
        self.tokens + EPSILON >= cost
    }

    /// Catch the level up to `now_ms`. A clock that moved backwards refills
    /// nothing and leaves the watermark alone.
    pub fn refill(&mut self, params: &BucketParams, now_ms: i64) {
        if now_ms <= self.refilled_at_ms {
            return;
        }
        let elapsed_ms = now_ms - self.refilled_at_ms;
        let refilled = self.tokens + elapsed_ms as f64 / 1000.0 * params.refill_per_sec;
        self.tokens = refilled.min(params.capacity);
        self.refilled_at_ms = now_ms;
    }

    /// Refill, then take `cost` tokens if the level covers it
    pub fn take(&mut self, params: &BucketParams, cost: f64, now_ms: i64) -> TakeResult {
        self.refill(params, now_ms);
        if self.covers(cost) {
            self.tokens = (self.tokens - cost).max(0.0);
            TakeResult::granted()
        } else {
            TakeResult::denied(wait_ms_for(cost - self.tokens, params.refill_per_sec))
        }
    }
}
