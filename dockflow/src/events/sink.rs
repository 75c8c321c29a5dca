//! Lifecycle events and the sinks that receive them.

use crate::core::Timestamp;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};

/// One job or stage transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// One of the names in [`super::event_types`].
    pub event_type: String,
    /// Event payload. Stage events carry `job_id`, `stage` and `kind`.
    pub data: serde_json::Value,
    /// When the event was emitted.
    pub at: Timestamp,
}

impl LifecycleEvent {
    /// Creates an event stamped now.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            at: chrono::Utc::now(),
        }
    }

    /// The stage this event is about, if any.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        self.data.get("stage").and_then(serde_json::Value::as_str)
    }

    /// The job this event belongs to, if recorded.
    #[must_use]
    pub fn job_id(&self) -> Option<&str> {
        self.data.get("job_id").and_then(serde_json::Value::as_str)
    }

    /// Returns true for failure events.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.event_type.ends_with(".failed")
    }
}

/// Receives lifecycle events from the coordinator.
///
/// Emission happens inline on the job's task, so implementations must not
/// block. A sink that cannot keep up should drop events rather than wait.
pub trait EventSink: Send + Sync {
    /// Records one event.
    fn record(&self, event: LifecycleEvent);

    /// Builds and records an event.
    fn try_emit(&self, event_type: &str, data: serde_json::Value) {
        self.record(LifecycleEvent::new(event_type, data));
    }
}

/// Discards every event. The coordinator's default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn record(&self, _event: LifecycleEvent) {}
}

/// Writes events to the `tracing` log.
///
/// Failures are logged at `WARN` and job state changes at `INFO`. Stage
/// progress is logged at the sink's level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::DEBUG }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging stage progress at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Logs stage progress at `INFO`.
    #[must_use]
    pub fn verbose() -> Self {
        Self::new(Level::INFO)
    }
}

impl EventSink for LoggingEventSink {
    fn record(&self, event: LifecycleEvent) {
        let stage = event.stage().unwrap_or("-");
        let job_id = event.job_id().unwrap_or("-");
        if event.is_failure() {
            warn!(event_type = %event.event_type, job_id, stage, data = %event.data, "Lifecycle event");
        } else if event.event_type == super::event_types::JOB_STATE_CHANGED
            || self.level <= Level::INFO
        {
            info!(event_type = %event.event_type, job_id, stage, data = %event.data, "Lifecycle event");
        } else {
            debug!(event_type = %event.event_type, job_id, stage, data = %event.data, "Lifecycle event");
        }
    }
}

/// Keeps every event in memory. Used by tests and short-lived tools.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<LifecycleEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.read().clone()
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Forgets all events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Event type names in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events
            .read()
            .iter()
            .map(|event| event.event_type.clone())
            .collect()
    }

    /// Events whose type starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<LifecycleEvent> {
        self.events
            .read()
            .iter()
            .filter(|event| event.event_type.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Index of the first `event_type` event about `stage`.
    #[must_use]
    pub fn position(&self, event_type: &str, stage: &str) -> Option<usize> {
        self.events
            .read()
            .iter()
            .position(|event| event.event_type == event_type && event.stage() == Some(stage))
    }
}

impl EventSink for CollectingEventSink {
    fn record(&self, event: LifecycleEvent) {
        self.events.write().push(event);
    }
}

/// Forwards events into a bounded channel, dropping them when it is full.
#[derive(Debug)]
pub struct ChannelEventSink {
    sender: mpsc::Sender<LifecycleEvent>,
    dropped: AtomicU64,
}

impl ChannelEventSink {
    /// Creates the sink and the receiving end of its channel.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LifecycleEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let sink = Self {
            sender,
            dropped: AtomicU64::new(0),
        };
        (sink, receiver)
    }

    /// Events dropped because the channel was full or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelEventSink {
    fn record(&self, event: LifecycleEvent) {
        if let Err(e) = self.sender.try_send(event) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total == 1 || total.is_power_of_two() {
                warn!(dropped = total, reason = %e, "Dropping lifecycle events");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_types;
    use serde_json::json;

    #[test]
    fn test_event_accessors() {
        let event = LifecycleEvent::new(
            event_types::STAGE_FAILED,
            json!({"job_id": "abc", "stage": "dock", "error": "exit code 1"}),
        );
        assert_eq!(event.stage(), Some("dock"));
        assert_eq!(event.job_id(), Some("abc"));
        assert!(event.is_failure());

        let state = LifecycleEvent::new(event_types::JOB_STATE_CHANGED, json!({"to": "docking"}));
        assert_eq!(state.stage(), None);
        assert!(!state.is_failure());
    }

    #[test]
    fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.try_emit(event_types::STAGE_STARTED, json!({"stage": "predict"}));
        LoggingEventSink::default().try_emit(event_types::STAGE_FAILED, json!({"stage": "dock"}));
        LoggingEventSink::verbose().try_emit(event_types::REPORT_WRITTEN, serde_json::Value::Null);
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.try_emit(event_types::STAGE_STARTED, json!({"stage": "predict"}));
        sink.try_emit(event_types::STAGE_STARTED, json!({"stage": "convert"}));
        sink.try_emit(event_types::STAGE_COMPLETED, json!({"stage": "convert"}));
        sink.try_emit(event_types::JOB_STATE_CHANGED, json!({"to": "converting"}));

        assert_eq!(sink.len(), 4);
        assert_eq!(sink.events_of_type("stage.").len(), 3);
        assert_eq!(sink.position(event_types::STAGE_COMPLETED, "convert"), Some(2));
        assert_eq!(sink.position(event_types::STAGE_COMPLETED, "predict"), None);
        assert_eq!(
            sink.event_types(),
            vec![
                "stage.started",
                "stage.started",
                "stage.completed",
                "job.state_changed"
            ]
        );

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut receiver) = ChannelEventSink::channel(2);
        for stage in ["predict", "convert", "prepare"] {
            sink.try_emit(event_types::STAGE_STARTED, json!({"stage": stage}));
        }
        assert_eq!(sink.dropped(), 1);

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.stage(), Some("predict"));
        assert_eq!(receiver.recv().await.unwrap().stage(), Some("convert"));
    }
}
