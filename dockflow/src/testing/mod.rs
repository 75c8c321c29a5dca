//! Testing utilities for dockflow jobs.
//!
//! This module provides:
//! - A scripted [`StageRunner`](crate::runner::StageRunner) that plays back
//!   per-stage file writes, log lines and exits
//! - Assertions on job outcomes

mod assertions;
#[cfg(test)]
pub(crate) mod fixtures;
mod mocks;

pub use assertions::{
    assert_artifacts_present, assert_failed_stage, assert_job_failed_with, assert_job_state,
    assert_job_succeeded,
};
pub use mocks::{LaunchEntry, ScriptStep, ScriptedRunner, StageScript};
