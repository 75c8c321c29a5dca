//! Pipeline definition and execution.
//!
//! This module provides:
//! - Stage specifications with declared inputs and artifacts
//! - A builder that validates stage graphs
//! - The coordinator that runs a job over a validated graph

mod builder;
mod coordinator;
mod dag;
mod spec;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use coordinator::{
    Coordinator, CoordinatorOptions, ExecutionPolicy, JobOutcome, JobPlan, MountLayout,
    JOB_FILE, STATE_DIR,
};
pub use dag::StageGraph;
pub use spec::{
    Arg, BuiltinTransform, CommandSpec, CompletionSignal, ContainerSpec, StageAction, StageSpec,
};
