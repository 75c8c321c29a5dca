//! Stage kinds, stage statuses and the job state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a stage performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Structure prediction from a sequence.
    Predict,
    /// Ligand format conversion.
    Convert,
    /// Receptor preparation from the predicted structure.
    Prepare,
    /// Receptor/ligand docking.
    Dock,
}

impl StageKind {
    /// Returns the job state entered while a stage of this kind runs.
    #[must_use]
    pub fn job_state(self) -> JobState {
        match self {
            Self::Predict => JobState::Predicting,
            Self::Convert => JobState::Converting,
            Self::Prepare => JobState::Preparing,
            Self::Dock => JobState::Docking,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Predict => write!(f, "predict"),
            Self::Convert => write!(f, "convert"),
            Self::Prepare => write!(f, "prepare"),
            Self::Dock => write!(f, "dock"),
        }
    }
}

/// The execution status of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage is pending execution.
    #[default]
    Pending,
    /// Stage is currently running.
    Running,
    /// Stage completed and its artifacts are stable.
    Ok,
    /// Stage was skipped because its artifacts already existed.
    Skip,
    /// Stage failed.
    Fail,
    /// Stage was cancelled.
    Cancel,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Ok => write!(f, "ok"),
            Self::Skip => write!(f, "skip"),
            Self::Fail => write!(f, "fail"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Skip | Self::Cancel | Self::Fail)
    }

    /// Returns true if the stage's artifacts are available downstream.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::Skip)
    }
}

/// Fine-grained job state.
///
/// `pending → predicting → converting → preparing → docking → reporting →
/// succeeded`, with `failed` reachable from every non-terminal state and
/// `timed_out` from every running state. Independent stages may overlap, in
/// which case the state follows the most recently started stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, nothing launched yet.
    #[default]
    Pending,
    /// Structure prediction is running.
    Predicting,
    /// Ligand conversion is running.
    Converting,
    /// Receptor preparation is running.
    Preparing,
    /// Docking is running.
    Docking,
    /// All stages done, report being rendered.
    Reporting,
    /// Report written.
    Succeeded,
    /// A stage or the report failed, or the job was aborted.
    Failed,
    /// A completion watcher exceeded its bound.
    TimedOut,
}

impl JobState {
    /// Returns true once the job can no longer change state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    /// Returns true while a stage is executing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Predicting | Self::Converting | Self::Preparing | Self::Docking
        )
    }

    /// Returns whether the state machine allows moving to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Pending => false,
            Self::Failed => true,
            Self::TimedOut => self.is_running(),
            Self::Reporting => self.is_running() || *self == Self::Pending,
            Self::Succeeded => *self == Self::Reporting,
            running => (*self == Self::Pending || self.is_running()) && running != *self,
        }
    }

    /// Projects the fine-grained state onto the coarse job status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Pending => JobStatus::Pending,
            Self::Predicting
            | Self::Converting
            | Self::Preparing
            | Self::Docking
            | Self::Reporting => JobStatus::Running,
            Self::Succeeded => JobStatus::Succeeded,
            Self::Failed => JobStatus::Failed,
            Self::TimedOut => JobStatus::TimedOut,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Predicting => "predicting",
            Self::Converting => "converting",
            Self::Preparing => "preparing",
            Self::Docking => "docking",
            Self::Reporting => "reporting",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Coarse job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Not started.
    Pending,
    /// Stages or reporting in progress.
    Running,
    /// Finished with a report.
    Succeeded,
    /// Finished without a report.
    Failed,
    /// Finished because a stage never produced its artifacts.
    TimedOut,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}
