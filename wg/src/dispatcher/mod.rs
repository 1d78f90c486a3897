//! Outbound call pacing
//!
//! Every upstream call in a process goes through one [`Dispatcher`]. It
//! holds calls to the in-flight ceiling, reserves quota through the
//! shared limiter before each start, keeps a minimum gap between
//! consecutive starts, and turns upstream rate-limit answers into
//! jittered retries. Callers hand it an async closure and get the
//! call's own result back.

mod config;
mod core;

pub use config::DispatcherConfig;
pub use self::core::{DispatchError, Dispatcher, DispatcherStats, RateLimitSignal};
