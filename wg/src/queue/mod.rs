//! Universal priority work queue
//!
//! Every long-running pipeline job in the system flows through one
//! [`WorkQueue`] per process, all of them sharing admission state through
//! the store. Producers enqueue opaque payloads with a size hint; the
//! hint maps to a priority band, claims go priority-first then FIFO, and
//! per-kind running ceilings hold across every participating process.
//! Handlers are registered per kind at startup; a job claimed in any
//! process runs that process's handler for its kind.

mod config;
mod core;
mod handler;
mod reports;

pub use config::QueueConfig;
pub use self::core::{QueueError, WorkQueue};
pub use handler::{HandlerError, HandlerRegistry, JobHandler, JobPayload, handler_fn, typed_handler};
pub use reports::{
    CancelReport, CancelResult, JobView, KindStatus, QueueStatusReport, QueueTotals, StatusReport,
    StatusSummary,
};
