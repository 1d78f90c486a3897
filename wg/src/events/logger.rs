//! Event Logger - persists events to a JSONL file
//!
//! The EventLogger subscribes to the EventBus and appends every event to
//! a single JSONL file for history and debugging. The `wg events` command
//! reads the same file back.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::bus::EventBus;
use super::types::{EventLogEntry, WgEvent};

/// Event logger that appends events to a JSONL file
pub struct EventLogger {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl EventLogger {
    /// Open (or create) the log file at `path` for appending
    pub fn new(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "EventLogger::new: opening log file");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Append one event as a JSON line
    pub fn write_event(&mut self, event: &WgEvent) -> eyre::Result<()> {
        debug!(event_type = event.event_type(), "EventLogger::write_event");
        let entry = EventLogEntry::new(event.clone());
        let json = serde_json::to_string(&entry)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Run the logger, draining the receiver until the channel closes
    ///
    /// This is meant to be spawned as a background task.
    pub async fn run(mut self, mut rx: broadcast::Receiver<WgEvent>) {
        debug!(path = ?self.path, "EventLogger::run: starting event logger");

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = self.write_event(&event) {
                        error!(error = %e, "EventLogger: failed to write event");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "EventLogger: lagged behind, missed events");
                    // Continue processing - we'll catch up
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("EventLogger: channel closed, shutting down");
                    break;
                }
            }
        }

        let _ = self.writer.flush();
    }
}

/// Read all entries from an event log file
pub fn read_event_log(path: impl AsRef<Path>) -> eyre::Result<Vec<EventLogEntry>> {
    let path = path.as_ref();
    debug!(?path, "read_event_log: reading log file");

    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventLogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(line, error = %e, "read_event_log: failed to parse line");
            }
        }
    }

    debug!(count = entries.len(), "read_event_log: loaded entries");
    Ok(entries)
}

/// Spawn the event logger as a background task
///
/// The subscription is taken before the task is spawned, so events emitted
/// after this call returns are captured even if the task has not run yet.
pub fn spawn_event_logger(event_bus: Arc<EventBus>, path: impl AsRef<Path>) -> eyre::Result<tokio::task::JoinHandle<()>> {
    let logger = EventLogger::new(path)?;
    let rx = event_bus.subscribe();
    Ok(tokio::spawn(async move {
        logger.run(rx).await;
    }))
}
