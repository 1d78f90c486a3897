//! Job records and lifecycle states
//!
//! A job is the unit of admitted work: an opaque payload tagged with a
//! pipeline kind, a priority band derived from the producer's size hint,
//! and lifecycle timestamps. Records are persisted field-by-field so the
//! store can flip state in place without rewriting the payload.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Current Unix time in milliseconds
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Pipeline job kinds (closed set, one worker loop per kind)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Analysis,
    Prospecting,
    Outreach,
    Report,
}

impl JobKind {
    /// All kinds, in a stable order (used to aggregate per-kind counts)
    pub const ALL: [JobKind; 4] = [
        JobKind::Analysis,
        JobKind::Prospecting,
        JobKind::Outreach,
        JobKind::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Prospecting => "prospecting",
            Self::Outreach => "outreach",
            Self::Report => "report",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "analysis" => Ok(Self::Analysis),
            "prospecting" => Ok(Self::Prospecting),
            "outreach" => Ok(Self::Outreach),
            "report" => Ok(Self::Report),
            _ => Err(format!("Unknown job kind: {}", s)),
        }
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting in the queue, not yet claimed
    #[default]
    Queued,
    /// Claimed by a worker and executing
    Running,
    /// Handler finished successfully
    Completed,
    /// Handler returned an error (or panicked)
    Failed,
    /// Cancelled while still queued
    Cancelled,
}

impl JobState {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Queued or running
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Legal lifecycle transitions
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, JobState::Running)
                | (Self::Queued, JobState::Cancelled)
                | (Self::Running, JobState::Completed)
                | (Self::Running, JobState::Failed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

/// Priority band for claim ordering; lower band number is claimed first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Numeric band stored and indexed by the store (1 = claimed first)
    pub fn band(&self) -> u8 {
        match self {
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    /// Map a producer size hint (work units) onto a band
    pub fn from_size_hint(units: u64, bands: &PriorityBands) -> Self {
        if units <= bands.small_max {
            Self::High
        } else if units <= bands.medium_max {
            Self::Normal
        } else {
            Self::Low
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Size-hint thresholds for band mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityBands {
    /// Hints up to this many units are high priority
    #[serde(default = "default_small_max", rename = "small-max")]
    pub small_max: u64,

    /// Hints up to this many units are normal priority; above is low
    #[serde(default = "default_medium_max", rename = "medium-max")]
    pub medium_max: u64,
}

fn default_small_max() -> u64 {
    10
}

fn default_medium_max() -> u64 {
    25
}

impl Default for PriorityBands {
    fn default() -> Self {
        Self {
            small_max: 10,
            medium_max: 25,
        }
    }
}

/// What a finished handler reports back to the store
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(serde_json::Value),
    Failed(String),
}

impl JobOutcome {
    /// Terminal state this outcome maps to
    pub fn state(&self) -> JobState {
        match self {
            Self::Completed(_) => JobState::Completed,
            Self::Failed(_) => JobState::Failed,
        }
    }
}

/// A persisted job: opaque payload plus lifecycle bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique identifier (UUIDv7, time-ordered)
    pub id: String,

    /// Pipeline kind; selects the worker loop
    pub kind: JobKind,

    /// Claim-ordering band derived from the size hint
    pub priority: Priority,

    /// Current lifecycle state
    pub state: JobState,

    /// Opaque producer payload; never interpreted by this layer
    pub payload: serde_json::Value,

    /// Producer size hint in work units (kept for observability)
    pub units: u64,

    /// Handler result; set only on completed jobs
    pub result: Option<serde_json::Value>,

    /// Captured handler error; set only on failed jobs
    pub error: Option<String>,

    /// Enqueue timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Claim timestamp
    pub started_at: Option<i64>,

    /// Terminal-transition timestamp
    pub completed_at: Option<i64>,

    /// Retention deadline; the record is purged past this point
    pub expires_at: i64,
}

impl JobRecord {
    /// Create a new queued job with a generated ID
    pub fn new(kind: JobKind, priority: Priority, payload: serde_json::Value, units: u64, ttl_ms: i64) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            kind,
            priority,
            state: JobState::Queued,
            payload,
            units,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            expires_at: now + ttl_ms,
        }
    }

    /// Create a job with a specific ID (for testing or replay)
    pub fn with_id(id: impl Into<String>, kind: JobKind, priority: Priority, payload: serde_json::Value) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            kind,
            priority,
            state: JobState::Queued,
            payload,
            units: 1,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            expires_at: now + 24 * 60 * 60 * 1000,
        }
    }

    /// Mark the job claimed by a worker
    pub fn start(&mut self, now: i64) {
        self.state = JobState::Running;
        self.started_at = Some(now);
    }

    /// Record a terminal outcome; result and error stay mutually exclusive
    pub fn finish(&mut self, outcome: &JobOutcome, now: i64) {
        self.state = outcome.state();
        self.completed_at = Some(now);
        match outcome {
            JobOutcome::Completed(value) => {
                self.result = Some(value.clone());
                self.error = None;
            }
            JobOutcome::Failed(message) => {
                self.error = Some(message.clone());
                self.result = None;
            }
        }
    }

    /// Mark a still-queued job cancelled
    pub fn cancel(&mut self, now: i64) {
        self.state = JobState::Cancelled;
        self.completed_at = Some(now);
    }

    /// Check if the record is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Check if the record is past its retention deadline
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Flatten to field/value pairs (the store's hash representation)
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("id", self.id.clone()),
            ("kind", self.kind.to_string()),
            ("priority", self.priority.to_string()),
            ("state", self.state.to_string()),
            ("payload", self.payload.to_string()),
            ("units", self.units.to_string()),
            ("created_at", self.created_at.to_string()),
            ("expires_at", self.expires_at.to_string()),
        ];
        if let Some(result) = &self.result {
            fields.push(("result", result.to_string()));
        }
        if let Some(error) = &self.error {
            fields.push(("error", error.clone()));
        }
        if let Some(started_at) = self.started_at {
            fields.push(("started_at", started_at.to_string()));
        }
        if let Some(completed_at) = self.completed_at {
            fields.push(("completed_at", completed_at.to_string()));
        }
        fields
    }

    /// Rebuild a record from stored field/value pairs
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, StoreError> {
        let id = fields.get("id").cloned().unwrap_or_default();
        let malformed = |reason: &str| StoreError::Malformed {
            id: if id.is_empty() { "<missing id>".to_string() } else { id.clone() },
            reason: reason.to_string(),
        };

        let required = |name: &str| fields.get(name).ok_or_else(|| malformed(&format!("missing field {}", name)));

        if id.is_empty() {
            return Err(malformed("missing field id"));
        }

        let kind: JobKind = required("kind")?.parse().map_err(|e: String| malformed(&e))?;
        let priority: Priority = required("priority")?.parse().map_err(|e: String| malformed(&e))?;
        let state: JobState = required("state")?.parse().map_err(|e: String| malformed(&e))?;
        let payload: serde_json::Value =
            serde_json::from_str(required("payload")?).map_err(|e| malformed(&format!("bad payload: {}", e)))?;
        let units: u64 = required("units")?
            .parse()
            .map_err(|_| malformed("bad units"))?;
        let created_at: i64 = required("created_at")?
            .parse()
            .map_err(|_| malformed("bad created_at"))?;
        let expires_at: i64 = required("expires_at")?
            .parse()
            .map_err(|_| malformed("bad expires_at"))?;

        let result = match fields.get("result") {
            Some(raw) => {
                Some(serde_json::from_str(raw).map_err(|e| malformed(&format!("bad result: {}", e)))?)
            }
            None => None,
        };
        let error = fields.get("error").cloned();
        let started_at = match fields.get("started_at") {
            Some(raw) => Some(raw.parse().map_err(|_| malformed("bad started_at"))?),
            None => None,
        };
        let completed_at = match fields.get("completed_at") {
            Some(raw) => Some(raw.parse().map_err(|_| malformed("bad completed_at"))?),
            None => None,
        };

        Ok(Self {
            id,
            kind,
            priority,
            state,
            payload,
            units,
            result,
            error,
            created_at,
            started_at,
            completed_at,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_record_new() {
        let record = JobRecord::new(JobKind::Analysis, Priority::Normal, json!({"url": "https://x.test"}), 5, 1000);
        assert!(!record.id.is_empty());
        assert_eq!(record.kind, JobKind::Analysis);
        assert_eq!(record.state, JobState::Queued);
        assert!(record.result.is_none());
        assert!(record.error.is_none());
        assert!(record.started_at.is_none());
        assert_eq!(record.expires_at, record.created_at + 1000);
    }

    #[test]
    fn test_priority_band_mapping() {
        let bands = PriorityBands::default();
        // Worked example: hints 1, 50, 3 land in bands 1, 3, 1
        assert_eq!(Priority::from_size_hint(1, &bands).band(), 1);
        assert_eq!(Priority::from_size_hint(50, &bands).band(), 3);
        assert_eq!(Priority::from_size_hint(3, &bands).band(), 1);
        // Threshold edges
        assert_eq!(Priority::from_size_hint(10, &bands), Priority::High);
        assert_eq!(Priority::from_size_hint(11, &bands), Priority::Normal);
        assert_eq!(Priority::from_size_hint(25, &bands), Priority::Normal);
        assert_eq!(Priority::from_size_hint(26, &bands), Priority::Low);
    }

    #[test]
    fn test_priority_claim_order() {
        // Lower band wins; enum order mirrors band order
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert!(Priority::High.band() < Priority::Low.band());
    }

    #[test]
    fn test_state_transitions() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Cancelled));
        assert!(JobState::Running.can_transition_to(JobState::Completed));
        assert!(JobState::Running.can_transition_to(JobState::Failed));

        // Running jobs cannot be cancelled, only allowed to finish
        assert!(!JobState::Running.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Queued.can_transition_to(JobState::Completed));

        // Terminal states admit nothing
        for terminal in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                JobState::Queued,
                JobState::Running,
                JobState::Completed,
                JobState::Failed,
                JobState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_finish_result_error_exclusive() {
        let mut record = JobRecord::with_id("j1", JobKind::Report, Priority::Normal, json!({}));
        record.start(now_ms());
        record.finish(&JobOutcome::Completed(json!({"rows": 3})), now_ms());
        assert_eq!(record.state, JobState::Completed);
        assert!(record.result.is_some());
        assert!(record.error.is_none());

        let mut record = JobRecord::with_id("j2", JobKind::Report, Priority::Normal, json!({}));
        record.start(now_ms());
        record.finish(&JobOutcome::Failed("boom".to_string()), now_ms());
        assert_eq!(record.state, JobState::Failed);
        assert!(record.result.is_none());
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_cancel_stamps_completed_at() {
        let mut record = JobRecord::with_id("j3", JobKind::Outreach, Priority::High, json!({}));
        record.cancel(now_ms());
        assert_eq!(record.state, JobState::Cancelled);
        assert!(record.completed_at.is_some());
        assert!(record.started_at.is_none());
    }

    #[test]
    fn test_is_expired() {
        let mut record = JobRecord::with_id("j4", JobKind::Analysis, Priority::Normal, json!({}));
        record.expires_at = record.created_at + 10;
        assert!(!record.is_expired(record.created_at));
        assert!(record.is_expired(record.created_at + 10));
        assert!(record.is_expired(record.created_at + 11));
    }

    #[test]
    fn test_field_codec_roundtrip() {
        let mut record = JobRecord::new(
            JobKind::Prospecting,
            Priority::Low,
            json!({"segment": "saas", "count": 40}),
            40,
            60_000,
        );
        record.start(now_ms());
        record.finish(&JobOutcome::Failed("timeout after 3 attempts".to_string()), now_ms());

        let map: HashMap<String, String> = record
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let parsed = JobRecord::from_fields(&map).unwrap();

        assert_eq!(parsed.id, record.id);
        assert_eq!(parsed.kind, record.kind);
        assert_eq!(parsed.priority, record.priority);
        assert_eq!(parsed.state, JobState::Failed);
        assert_eq!(parsed.payload, record.payload);
        assert_eq!(parsed.units, 40);
        assert_eq!(parsed.error, record.error);
        assert!(parsed.result.is_none());
        assert_eq!(parsed.started_at, record.started_at);
        assert_eq!(parsed.completed_at, record.completed_at);
        assert_eq!(parsed.expires_at, record.expires_at);
    }

    #[test]
    fn test_field_codec_queued_omits_optionals() {
        let record = JobRecord::new(JobKind::Analysis, Priority::High, json!(null), 1, 1000);
        let fields = record.to_fields();
        let names: Vec<&str> = fields.iter().map(|(k, _)| *k).collect();
        assert!(names.contains(&"id"));
        assert!(!names.contains(&"result"));
        assert!(!names.contains(&"error"));
        assert!(!names.contains(&"started_at"));
        assert!(!names.contains(&"completed_at"));
    }

    #[test]
    fn test_from_fields_rejects_garbage() {
        let mut map = HashMap::new();
        map.insert("id".to_string(), "j9".to_string());
        map.insert("kind".to_string(), "juggling".to_string());
        let err = JobRecord::from_fields(&map).unwrap_err();
        assert!(err.to_string().contains("j9"));
    }

    #[test]
    fn test_kind_parse_display() {
        for kind in JobKind::ALL {
            let parsed: JobKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("nonsense".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&JobState::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        let state: JobState = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(state, JobState::Running);
    }
}
