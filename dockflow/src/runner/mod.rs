//! Stage runner: launches one external step.
//!
//! A runner turns a [`LaunchRequest`] into a running process and hands back
//! an [`ExecutionRecord`] immediately. The record is the only way the
//! coordinator observes the process: it exposes the exit outcome once known,
//! a bounded tail of the process's log lines, and a termination request.

mod process;
mod record;

pub use process::{ProcessRunner, DEFAULT_LOG_CAPACITY};
pub use record::{ExecutionControl, ExecutionRecord, LogBuffer};

use crate::errors::DockflowError;
use crate::mounts::MountTable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How a finished process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitOutcome {
    /// Exited with status zero.
    Success,
    /// Exited unsuccessfully. `code` is absent when a signal ended it.
    Failure {
        /// The exit code, if any.
        code: Option<i32>,
    },
    /// Terminated at the coordinator's request.
    Killed,
    /// The exit state could not be determined.
    Unknown,
}

impl ExitOutcome {
    /// Returns true for a zero exit.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        if status.success() {
            Self::Success
        } else {
            Self::Failure {
                code: status.code(),
            }
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure { code: Some(code) } => write!(f, "exit code {code}"),
            Self::Failure { code: None } => write!(f, "termination by signal"),
            Self::Killed => write!(f, "termination request"),
            Self::Unknown => write!(f, "unknown exit state"),
        }
    }
}

/// Isolation mode for a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run the program directly on the host.
    Plain,
    /// Run inside a container started from `image`.
    Container {
        /// Image reference.
        image: String,
        /// Optional `uid[:gid]` to run as.
        user: Option<String>,
    },
}

/// Everything a runner needs to start one stage.
///
/// In container mode an empty `program` runs the image's entrypoint with
/// `args`.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Stage name, used for logging and container naming.
    pub stage: String,
    /// Executable to run.
    pub program: String,
    /// Arguments, already translated for the execution mode.
    pub args: Vec<String>,
    /// Bind mounts (container mode only).
    pub mounts: MountTable,
    /// Plain or containerized.
    pub mode: ExecutionMode,
    /// Request accelerator access.
    pub gpu: bool,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory for plain launches.
    pub working_dir: Option<PathBuf>,
}

impl LaunchRequest {
    /// Creates a plain launch of `program`.
    #[must_use]
    pub fn new(stage: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            program: program.into(),
            args: Vec::new(),
            mounts: MountTable::new(),
            mode: ExecutionMode::Plain,
            gpu: false,
            env: Vec::new(),
            working_dir: None,
        }
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the mount table.
    #[must_use]
    pub fn with_mounts(mut self, mounts: MountTable) -> Self {
        self.mounts = mounts;
        self
    }

    /// Runs the program inside `image`.
    #[must_use]
    pub fn in_container(mut self, image: impl Into<String>, user: Option<String>) -> Self {
        self.mode = ExecutionMode::Container {
            image: image.into(),
            user,
        };
        self
    }

    /// Sets the accelerator hint.
    #[must_use]
    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Returns true for container launches.
    #[must_use]
    pub fn is_container(&self) -> bool {
        matches!(self.mode, ExecutionMode::Container { .. })
    }
}

/// Launches external steps.
#[async_trait]
pub trait StageRunner: Send + Sync + fmt::Debug {
    /// Starts the step and returns its record without waiting for it.
    ///
    /// # Errors
    ///
    /// `StageLaunchFailure` if the process could not be started.
    async fn launch(&self, request: &LaunchRequest) -> Result<ExecutionRecord, DockflowError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_outcome_display() {
        assert_eq!(ExitOutcome::Failure { code: Some(2) }.to_string(), "exit code 2");
        assert_eq!(ExitOutcome::Killed.to_string(), "termination request");
        assert!(ExitOutcome::Success.is_success());
        assert!(!ExitOutcome::Unknown.is_success());
    }

    #[test]
    fn test_exit_outcome_serde() {
        let json = serde_json::to_value(ExitOutcome::Failure { code: Some(1) }).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "failure", "code": 1}));
    }

    #[test]
    fn test_launch_request_builder() {
        let request = LaunchRequest::new("predict", "")
            .with_args(["--fasta_paths=/mnt/fasta_path_0/Y265H.fasta"])
            .in_container("alphafold", None)
            .with_gpu(true)
            .with_env("TF_FORCE_UNIFIED_MEMORY", "1");

        assert!(request.is_container());
        assert!(request.gpu);
        assert_eq!(request.args.len(), 1);
        assert_eq!(request.env[0].0, "TF_FORCE_UNIFIED_MEMORY");
    }
}
