//! # Dockflow
//!
//! A coordinator for a three-tool computational chemistry pipeline:
//! structure prediction in a container, ligand conversion and docking.
//!
//! Dockflow provides:
//!
//! - **Stage graphs**: stages declare their artifacts and dependencies and
//!   run as soon as their inputs are ready
//! - **Path translation**: host paths are mapped into container mounts
//! - **Completion watching**: artifacts are polled until they are stable,
//!   with a bound on every wait
//! - **Lifecycle events**: every job and stage transition is reported to an
//!   [`events::EventSink`]
//! - **Reports**: a single HTML page summarizing the job's outputs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dockflow::prelude::*;
//!
//! let config = Config::from_env()?;
//! let pipeline = DockingPipeline::new(config);
//! let request = DockingRequest::new("Y265H.fasta", "1", "mol2", "results/Y265H");
//!
//! let plan = pipeline.plan(&request)?;
//! let outcome = pipeline.coordinator().run(plan, &CancellationToken::new()).await;
//! let manifest = outcome.into_result()?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod docking;
pub mod errors;
pub mod events;
pub mod mounts;
pub mod observability;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod service;
pub mod testing;
pub mod watcher;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{Config, DbPreset, ModelPreset};
    pub use crate::core::{
        ArtifactKind, DeclaredArtifact, Job, JobId, JobState, ResultManifest, StageKind,
        StageStatus,
    };
    pub use crate::docking::{DockingLayout, DockingPipeline, DockingRequest};
    pub use crate::errors::DockflowError;
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::mounts::{MountTable, PathTranslator};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        Coordinator, CoordinatorOptions, ExecutionPolicy, JobOutcome, JobPlan, PipelineBuilder,
        StageSpec,
    };
    pub use crate::report::ReportSpec;
    pub use crate::runner::{ExitOutcome, LaunchRequest, ProcessRunner, StageRunner};
    pub use crate::service::{JobHandle, JobService};
    pub use crate::watcher::{CompletionWatcher, WaitPolicy};
}
