//! Caller-facing report shapes
//!
//! Status and cancel answer per requested id and never error on unknown
//! ids; an id that is missing (never enqueued, or past retention) counts
//! as `not_found`. Queue status aggregates the per-kind counters.

use std::collections::BTreeMap;

use gatestore::{JobCounts, JobRecord, JobState};
use serde::{Deserialize, Serialize};

/// One job as reported to a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: String,

    pub state: JobState,

    /// Numeric priority band; 1 is claimed first
    pub priority: u8,

    pub created_at: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind.to_string(),
            state: record.state,
            priority: record.priority.band(),
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            result: record.result,
            error: record.error,
        }
    }
}

/// State tally over one status call's requested ids
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub not_found: u64,
}

impl StatusSummary {
    pub fn bump(&mut self, state: JobState) {
        match state {
            JobState::Queued => self.queued += 1,
            JobState::Running => self.running += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
            JobState::Cancelled => self.cancelled += 1,
        }
    }
}

/// Answer to `status(ids)`: found jobs plus a tally of every requested id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub jobs: Vec<JobView>,
    pub summary: StatusSummary,
}

/// Per-id cancel outcome; false covers running, terminal, and unknown ids
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResult {
    pub id: String,
    pub cancelled: bool,
}

/// Answer to `cancel(ids)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelReport {
    /// How many of the requested jobs were actually cancelled
    pub cancelled: u64,

    /// How many ids were requested
    pub total: u64,

    pub results: Vec<CancelResult>,
}

/// One kind's counters as reported by queue status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindStatus {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,

    /// Everything the counters have seen, cancelled included
    pub total: u64,
}

impl From<JobCounts> for KindStatus {
    fn from(counts: JobCounts) -> Self {
        Self {
            queued: counts.queued,
            running: counts.running,
            completed: counts.completed,
            failed: counts.failed,
            total: counts.total(),
        }
    }
}

/// Cross-kind totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTotals {
    pub total_queued: u64,
    pub total_running: u64,
    pub total_completed: u64,
    pub total_failed: u64,
}

/// Answer to `queue_status()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatusReport {
    /// Counters per kind, keyed by kind name
    pub types: BTreeMap<String, KindStatus>,

    pub stats: QueueTotals,

    /// True while counters come from the process-local overlay
    pub degraded: bool,
}
