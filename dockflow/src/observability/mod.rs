//! Observability utilities.

mod subscriber;
mod tracing;

pub use subscriber::{init_tracing, LogFormat, DEFAULT_FILTER};
pub use tracing::{SpanTimer, StageSpanAttributes};
