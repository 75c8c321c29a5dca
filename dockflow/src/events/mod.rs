//! Lifecycle event emission.
//!
//! The coordinator reports job and stage transitions to an [`EventSink`].
//! Sinks are passed explicitly; there is no process-wide sink.

mod sink;

pub use sink::{
    ChannelEventSink, CollectingEventSink, EventSink, LifecycleEvent, LoggingEventSink,
    NoOpEventSink,
};

/// Event type names emitted by the coordinator.
pub mod event_types {
    /// The job moved to a new state.
    pub const JOB_STATE_CHANGED: &str = "job.state_changed";
    /// A stage process (or built-in transform) was started.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage's artifacts were confirmed.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage was not run because its artifacts already existed.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// A stage failed, timed out or was cancelled.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// The report was written.
    pub const REPORT_WRITTEN: &str = "report.written";
}
