//! Event system for admission observability
//!
//! Every job transition and store health change emits a [`WgEvent`] to a
//! broadcast bus. Consumers subscribe independently: the JSONL logger for
//! history, the CLI for live inspection. Emission is fire-and-forget and
//! never blocks the emitting component.

mod bus;
mod logger;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, create_event_bus};
pub use logger::{EventLogger, read_event_log, spawn_event_logger};
pub use types::{EventLogEntry, WgEvent};
