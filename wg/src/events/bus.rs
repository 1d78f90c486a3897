//! Event Bus - central pub/sub system for WorkGate events
//!
//! The EventBus uses tokio broadcast channels to deliver events to all
//! subscribers with minimal latency. Components emit events, consumers
//! (CLI watchers, loggers) subscribe.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::types::WgEvent;

/// Default channel capacity (events)
///
/// Admission events are low-rate compared to the work they gate; a burst
/// of a full queue drain still fits comfortably.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Central event bus for WorkGate activity streaming
///
/// Every job transition and store health change emits an event to this
/// bus. Consumers (file logger, CLI) subscribe to receive them.
pub struct EventBus {
    tx: broadcast::Sender<WgEvent>,
    #[allow(dead_code)]
    channel_capacity: usize,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            channel_capacity: capacity,
        }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers
    ///
    /// This is fire-and-forget: if there are no subscribers, the event is
    /// dropped. If the channel is full, oldest events are dropped.
    pub fn emit(&self, event: WgEvent) {
        debug!(event_type = event.event_type(), job_id = ?event.job_id(), "EventBus::emit");
        // Ignore send errors (no subscribers is OK)
        let _ = self.tx.send(event);
    }

    /// Subscribe to receive events
    ///
    /// Returns a receiver that will receive all events emitted after
    /// subscription. Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<WgEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Create an emitter handle for a specific component
    ///
    /// The emitter provides convenience methods for emitting events and
    /// stamps store health events with the component name.
    pub fn emitter_for(&self, component: impl Into<String>) -> EventEmitter {
        let component = component.into();
        debug!(%component, "EventBus::emitter_for: creating emitter");
        EventEmitter {
            tx: self.tx.clone(),
            component,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Handle for components to emit events without owning the bus
///
/// EventEmitter is cheap to clone and provides convenience methods with a
/// pre-set component name for store health transitions.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<WgEvent>,
    component: String,
}

impl EventEmitter {
    /// Get the component name this emitter is bound to
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Emit a raw event
    pub fn emit(&self, event: WgEvent) {
        debug!(event_type = event.event_type(), "EventEmitter::emit");
        let _ = self.tx.send(event);
    }

    // === Convenience methods ===

    /// Emit a job queued event
    pub fn job_queued(&self, job_id: &str, kind: &str, priority: &str) {
        self.emit(WgEvent::JobQueued {
            job_id: job_id.to_string(),
            kind: kind.to_string(),
            priority: priority.to_string(),
        });
    }

    /// Emit a job started event
    pub fn job_started(&self, job_id: &str, kind: &str) {
        self.emit(WgEvent::JobStarted {
            job_id: job_id.to_string(),
            kind: kind.to_string(),
        });
    }

    /// Emit a job completed event
    pub fn job_completed(&self, job_id: &str, kind: &str, duration_ms: u64) {
        self.emit(WgEvent::JobCompleted {
            job_id: job_id.to_string(),
            kind: kind.to_string(),
            duration_ms,
        });
    }

    /// Emit a job failed event
    pub fn job_failed(&self, job_id: &str, kind: &str, error: &str) {
        self.emit(WgEvent::JobFailed {
            job_id: job_id.to_string(),
            kind: kind.to_string(),
            error: error.to_string(),
        });
    }

    /// Emit a job cancelled event
    pub fn job_cancelled(&self, job_id: &str, kind: &str) {
        self.emit(WgEvent::JobCancelled {
            job_id: job_id.to_string(),
            kind: kind.to_string(),
        });
    }

    /// Emit a store degraded event for this component
    pub fn store_degraded(&self, reason: &str) {
        self.emit(WgEvent::StoreDegraded {
            component: self.component.clone(),
            reason: reason.to_string(),
        });
    }

    /// Emit a store recovered event for this component
    pub fn store_recovered(&self) {
        self.emit(WgEvent::StoreRecovered {
            component: self.component.clone(),
        });
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_event_bus_creation() {
        let bus = EventBus::new(100);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_bus_subscribe() {
        let bus = EventBus::new(100);
        let _rx1 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new(100);
        let mut rx = bus.subscribe();

        bus.emit(WgEvent::JobQueued {
            job_id: "job-1".to_string(),
            kind: "analysis".to_string(),
            priority: "normal".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), Some("job-1"));
        assert_eq!(event.event_type(), "JobQueued");
    }

    #[tokio::test]
    async fn test_event_bus_no_subscribers() {
        let bus = EventBus::new(100);
        // This should not panic even with no subscribers
        bus.emit(WgEvent::JobStarted {
            job_id: "job-1".to_string(),
            kind: "analysis".to_string(),
        });
    }

    #[tokio::test]
    async fn test_event_emitter() {
        let bus = EventBus::new(100);
        let mut rx = bus.subscribe();
        let emitter = bus.emitter_for("queue");

        emitter.job_queued("job-7", "report", "low");

        let event = rx.recv().await.unwrap();
        match event {
            WgEvent::JobQueued { job_id, kind, priority } => {
                assert_eq!(job_id, "job-7");
                assert_eq!(kind, "report");
                assert_eq!(priority, "low");
            }
            _ => panic!("Expected JobQueued event"),
        }
    }

    #[tokio::test]
    async fn test_event_emitter_component_binding() {
        let bus = EventBus::new(100);
        let mut rx = bus.subscribe();
        let emitter = bus.emitter_for("limiter");
        assert_eq!(emitter.component(), "limiter");

        emitter.store_degraded("connection refused");
        emitter.store_recovered();

        match rx.recv().await.unwrap() {
            WgEvent::StoreDegraded { component, reason } => {
                assert_eq!(component, "limiter");
                assert_eq!(reason, "connection refused");
            }
            other => panic!("Expected StoreDegraded, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            WgEvent::StoreRecovered { component } => assert_eq!(component, "limiter"),
            other => panic!("Expected StoreRecovered, got {:?}", other),
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(100);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(WgEvent::JobCancelled {
            job_id: "job-9".to_string(),
            kind: "prospecting".to_string(),
        });

        // Both subscribers should receive the event
        assert_eq!(rx1.recv().await.unwrap().job_id(), Some("job-9"));
        assert_eq!(rx2.recv().await.unwrap().job_id(), Some("job-9"));
    }
}
