//! WorkGate - admission control for shared upstream quotas
//!
//! WorkGate sits between job producers and rate-limited upstreams. Every
//! process runs the same admission layer; the shared store is what makes
//! their decisions agree.
//!
//! # Core Concepts
//!
//! - **Admission Before Work**: A call runs only after every bucket it
//!   touches has been charged and an in-flight slot is held
//! - **Shared Truth, Local Fallback**: Buckets and job state live in the
//!   shared store; an outage degrades each process to its own local view
//!   instead of stopping it
//! - **Strict Ceilings**: Per-kind running limits hold across processes
//!   because claiming a job and counting it are one atomic step
//! - **Pressure Is Visible**: Denials carry the wait that would clear
//!   them, and every lifecycle transition lands on the event bus
//!
//! # Modules
//!
//! - [`limiter`] - Token bucket admission, local and store-backed
//! - [`dispatcher`] - Paced dispatch with retry and backoff
//! - [`queue`] - Cross-process work queue with priority bands
//! - [`events`] - Event bus and JSONL event log
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod limiter;
pub mod queue;

// Re-export commonly used types
pub use config::{Config, STORE_URL_ENV, StoreConfig};
pub use dispatcher::{DispatchError, Dispatcher, DispatcherConfig, DispatcherStats, RateLimitSignal};
pub use limiter::{DistributedLimiter, LocalLimiter, QuotaKey, QuotaSpec, Quotas, Reservation};
pub use queue::{
    CancelReport, CancelResult, HandlerError, HandlerRegistry, JobHandler, JobPayload, JobView, KindStatus,
    QueueConfig, QueueError, QueueStatusReport, QueueTotals, StatusReport, StatusSummary, WorkQueue, handler_fn,
    typed_handler,
};

// Events module re-exports
pub use events::{
    EventBus, EventEmitter, EventLogEntry, EventLogger, WgEvent, create_event_bus, read_event_log,
    spawn_event_logger,
};
