//! Test assertions for job outcomes.

use crate::core::{ArtifactKind, JobState, StageKind};
use crate::errors::DockflowError;
use crate::pipeline::JobOutcome;

/// Asserts that the job succeeded and wrote its report.
pub fn assert_job_succeeded(outcome: &JobOutcome) {
    assert!(
        outcome.is_success(),
        "Expected success, got state {} with error: {:?}",
        outcome.job.state(),
        outcome.result.as_ref().err()
    );
    assert!(outcome.report.is_some(), "Expected a report path");
}

/// Asserts that the job ended in `expected`.
pub fn assert_job_state(outcome: &JobOutcome, expected: JobState) {
    assert_eq!(
        outcome.job.state(),
        expected,
        "Expected state {}, got {} with error: {:?}",
        expected,
        outcome.job.state(),
        outcome.result.as_ref().err()
    );
}

/// Asserts that the job failed with an error of type `error_type` and wrote
/// no report.
pub fn assert_job_failed_with(outcome: &JobOutcome, error_type: &str) {
    let err = outcome
        .result
        .as_ref()
        .err()
        .unwrap_or_else(|| panic!("Expected {error_type}, but the job succeeded"));
    assert_eq!(
        err.error_type(),
        error_type,
        "Expected {error_type}, got: {err}"
    );
    assert!(outcome.report.is_none(), "Failed job must not have a report");
}

/// Asserts that the failure record attributes the failure to `kind`.
pub fn assert_failed_stage(outcome: &JobOutcome, kind: StageKind) {
    let failure = outcome
        .job
        .failure()
        .unwrap_or_else(|| panic!("Expected a failure record"));
    assert_eq!(failure.stage_kind, Some(kind), "Failure record: {failure:?}");
}

/// Asserts that every artifact of a successful job exists and is non-empty.
pub fn assert_artifacts_present(outcome: &JobOutcome) {
    let manifest = outcome
        .result
        .as_ref()
        .unwrap_or_else(|e: &DockflowError| panic!("Expected a manifest, got: {e}"));
    for kind in ArtifactKind::ALL {
        let path = manifest
            .get(kind)
            .unwrap_or_else(|| panic!("Manifest lacks {kind}"));
        let len = std::fs::metadata(path)
            .map(|m| m.len())
            .unwrap_or_else(|e| panic!("{} is missing: {e}", path.display()));
        assert!(len > 0, "{} is empty", path.display());
    }
}
