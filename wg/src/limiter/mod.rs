//! Rate limiting for upstream provider calls
//!
//! Two limiters share one quota vocabulary: [`LocalLimiter`] paces a
//! single process, [`DistributedLimiter`] coordinates every process
//! through the shared store and falls back to local buckets when the
//! store is away.

mod distributed;
mod local;
mod quota;

pub use distributed::{DistributedLimiter, Reservation};
pub use local::LocalLimiter;
pub use quota::{QuotaKey, QuotaSpec, Quotas};
