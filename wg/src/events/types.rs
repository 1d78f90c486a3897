//! Event types for admission activity streaming
//!
//! These events represent all observable activity in WorkGate:
//! - Job lifecycle (queued, started, completed, failed, cancelled)
//! - Store health transitions (degraded, recovered)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Core event enum - the vocabulary of WorkGate activity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WgEvent {
    // === Job Lifecycle ===
    /// A job has been accepted into the queue
    JobQueued {
        job_id: String,
        kind: String,
        priority: String,
    },
    /// A worker has claimed a job and begun running it
    JobStarted { job_id: String, kind: String },
    /// A job finished cleanly
    JobCompleted {
        job_id: String,
        kind: String,
        duration_ms: u64,
    },
    /// A job's handler returned an error or panicked
    JobFailed {
        job_id: String,
        kind: String,
        error: String,
    },
    /// A job was cancelled before any worker picked it up
    JobCancelled { job_id: String, kind: String },

    // === Store Health ===
    /// A component lost the shared store and switched to local state
    StoreDegraded { component: String, reason: String },
    /// A degraded component reached the shared store again
    StoreRecovered { component: String },
}

impl WgEvent {
    /// Get the job ID for this event, if it concerns a job
    pub fn job_id(&self) -> Option<&str> {
        match self {
            WgEvent::JobQueued { job_id, .. }
            | WgEvent::JobStarted { job_id, .. }
            | WgEvent::JobCompleted { job_id, .. }
            | WgEvent::JobFailed { job_id, .. }
            | WgEvent::JobCancelled { job_id, .. } => Some(job_id),
            WgEvent::StoreDegraded { .. } | WgEvent::StoreRecovered { .. } => None,
        }
    }

    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            WgEvent::JobQueued { .. } => "JobQueued",
            WgEvent::JobStarted { .. } => "JobStarted",
            WgEvent::JobCompleted { .. } => "JobCompleted",
            WgEvent::JobFailed { .. } => "JobFailed",
            WgEvent::JobCancelled { .. } => "JobCancelled",
            WgEvent::StoreDegraded { .. } => "StoreDegraded",
            WgEvent::StoreRecovered { .. } => "StoreRecovered",
        }
    }
}

/// A timestamped event log entry for file persistence
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Timestamp of the event
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    /// The event
    pub event: WgEvent,
}

impl EventLogEntry {
    /// Create a new log entry with current timestamp
    pub fn new(event: WgEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_job_id() {
        let event = WgEvent::JobQueued {
            job_id: "job-123".to_string(),
            kind: "analysis".to_string(),
            priority: "high".to_string(),
        };
        assert_eq!(event.job_id(), Some("job-123"));

        let event = WgEvent::StoreDegraded {
            component: "queue".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(event.job_id(), None);
    }

    #[test]
    fn test_event_type() {
        let event = WgEvent::JobFailed {
            job_id: "job-123".to_string(),
            kind: "outreach".to_string(),
            error: "boom".to_string(),
        };
        assert_eq!(event.event_type(), "JobFailed");
    }

    #[test]
    fn test_event_serialization() {
        let event = WgEvent::JobCompleted {
            job_id: "job-123".to_string(),
            kind: "report".to_string(),
            duration_ms: 1500,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("JobCompleted"));
        assert!(json.contains("1500"));

        // Deserialize back
        let parsed: WgEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.job_id(), Some("job-123"));
    }

    #[test]
    fn test_event_log_entry() {
        let event = WgEvent::JobStarted {
            job_id: "job-123".to_string(),
            kind: "analysis".to_string(),
        };
        let entry = EventLogEntry::new(event);

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("ts"));
        assert!(json.contains("JobStarted"));
    }
}
