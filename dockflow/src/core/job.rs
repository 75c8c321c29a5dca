//! The job record owned by the coordinator.

use super::{JobState, JobStatus, StageKind, Timestamp};
use crate::errors::DockflowError;
use crate::runner::ExitOutcome;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wraps a caller-supplied identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives a deterministic identifier from the submission components.
    ///
    /// Resubmitting the same request yields the same id, which keeps resumed
    /// jobs recognisable in logs and reports.
    #[must_use]
    pub fn fingerprint(components: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(components.join("\u{1f}").as_bytes());
        let digest = hasher.finalize();
        Self(format!("job-{}", hex::encode(&digest[..8])))
    }

    /// Returns a random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(format!("job-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry in the job's state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTransition {
    /// The state entered.
    pub state: JobState,
    /// When it was entered.
    pub at: Timestamp,
}

/// Why a job did not succeed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Name of the failing stage, if a stage failed.
    pub stage: Option<String>,
    /// Kind of the failing stage.
    pub stage_kind: Option<StageKind>,
    /// Error message.
    pub error: String,
    /// Error type name.
    pub error_type: String,
    /// Whether resubmitting the job might succeed.
    pub recoverable: bool,
    /// How the stage process ended, when known.
    pub exit: Option<ExitOutcome>,
    /// Last log lines of the failing stage.
    #[serde(default)]
    pub log_tail: Vec<String>,
    /// When the failure was recorded.
    pub timestamp: Timestamp,
}

impl FailureRecord {
    /// Builds a record from an error, optionally attributing it to a stage.
    #[must_use]
    pub fn from_error(stage: Option<(&str, StageKind)>, error: &DockflowError) -> Self {
        let exit = match error {
            DockflowError::StageProcessFailure { outcome, .. } => Some(*outcome),
            _ => None,
        };

        Self {
            stage: stage.map(|(name, _)| name.to_string()),
            stage_kind: stage.map(|(_, kind)| kind),
            error: error.to_string(),
            error_type: error.error_type().to_string(),
            recoverable: !error.is_configuration_error(),
            exit,
            log_tail: error.log_tail().to_vec(),
            timestamp: Utc::now(),
        }
    }
}

/// A unit of work driven by the coordinator.
///
/// The output directory is owned exclusively by this job. Only the
/// coordinator mutates the state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    output_dir: PathBuf,
    state: JobState,
    transitions: Vec<JobTransition>,
    failure: Option<FailureRecord>,
    created_at: Timestamp,
}

impl Job {
    /// Creates a pending job.
    #[must_use]
    pub fn new(id: JobId, output_dir: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id,
            output_dir: output_dir.into(),
            state: JobState::Pending,
            transitions: vec![JobTransition {
                state: JobState::Pending,
                at: now,
            }],
            failure: None,
            created_at: now,
        }
    }

    /// Returns the job id.
    #[must_use]
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Returns the job's output directory.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Returns the current fine-grained state.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Returns the coarse status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    /// Returns the state history, oldest first.
    #[must_use]
    pub fn transitions(&self) -> &[JobTransition] {
        &self.transitions
    }

    /// Returns true if the job ever entered `state`.
    #[must_use]
    pub fn visited(&self, state: JobState) -> bool {
        self.transitions.iter().any(|t| t.state == state)
    }

    /// Returns the failure record, if the job failed.
    #[must_use]
    pub fn failure(&self) -> Option<&FailureRecord> {
        self.failure.as_ref()
    }

    /// Returns when the job was created.
    #[must_use]
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Moves the job to `next` if the state machine allows it.
    ///
    /// Returns false (and leaves the state unchanged) otherwise.
    pub fn transition(&mut self, next: JobState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            warn!(
                job_id = %self.id,
                from = %self.state,
                to = %next,
                "Rejected job state transition"
            );
            return false;
        }
        self.state = next;
        self.transitions.push(JobTransition {
            state: next,
            at: Utc::now(),
        });
        true
    }

    /// Finalizes the job as failed or timed out.
    pub fn fail(&mut self, record: FailureRecord, timed_out: bool) {
        let next = if timed_out && self.state.is_running() {
            JobState::TimedOut
        } else {
            JobState::Failed
        };
        if self.transition(next) {
            self.failure = Some(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = JobId::fingerprint(&["Y265H", "1", "mol2", "/tmp/job1"]);
        let b = JobId::fingerprint(&["Y265H", "1", "mol2", "/tmp/job1"]);
        let c = JobId::fingerprint(&["Y265H", "2", "mol2", "/tmp/job1"]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("job-"));
        assert_eq!(a.as_str().len(), "job-".len() + 16);
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(JobId::random(), JobId::random());
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new(JobId::new("j1"), "/tmp/job1");
        assert_eq!(job.state(), JobState::Pending);
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.transitions().len(), 1);
        assert!(job.failure().is_none());
    }

    #[test]
    fn test_transition_history() {
        let mut job = Job::new(JobId::new("j1"), "/tmp/job1");
        assert!(job.transition(JobState::Predicting));
        assert!(job.transition(JobState::Docking));
        assert!(!job.transition(JobState::Succeeded));

        let states: Vec<_> = job.transitions().iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![JobState::Pending, JobState::Predicting, JobState::Docking]
        );
    }

    #[test]
    fn test_fail_from_pending_never_times_out() {
        let mut job = Job::new(JobId::new("j1"), "/tmp/job1");
        let err = DockflowError::source_not_found("/data/Y265H.fasta");
        job.fail(FailureRecord::from_error(None, &err), true);

        assert_eq!(job.state(), JobState::Failed);
        let failure = job.failure().unwrap();
        assert_eq!(failure.error_type, "SourceNotFound");
        assert!(!failure.recoverable);
        assert!(!job.visited(JobState::Predicting));
    }

    #[test]
    fn test_timeout_while_running() {
        let mut job = Job::new(JobId::new("j1"), "/tmp/job1");
        job.transition(JobState::Predicting);
        let err = DockflowError::StageTimeout {
            stage: "predict".to_string(),
            artifacts: Vec::new(),
            polls: 3,
            waited: std::time::Duration::from_secs(1),
        };
        job.fail(
            FailureRecord::from_error(Some(("predict", StageKind::Predict)), &err),
            true,
        );

        assert_eq!(job.state(), JobState::TimedOut);
        assert_eq!(job.failure().unwrap().stage_kind, Some(StageKind::Predict));
    }

    #[test]
    fn test_failure_record_captures_exit() {
        let err = DockflowError::process_failure(
            "dock",
            ExitOutcome::Failure { code: Some(2) },
            vec!["bad receptor".to_string()],
        );
        let record = FailureRecord::from_error(Some(("dock", StageKind::Dock)), &err);

        assert_eq!(record.exit, Some(ExitOutcome::Failure { code: Some(2) }));
        assert_eq!(record.log_tail, vec!["bad receptor".to_string()]);
        assert!(record.recoverable);
    }
}
