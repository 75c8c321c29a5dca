//! Error types for the dockflow coordinator.
//!
//! Path-translation and report errors describe configuration problems and are
//! never retried. Stage errors carry enough context (stage, exit state, last
//! log lines) for an operator to decide whether to resubmit the job.

use crate::core::ArtifactKind;
use crate::runner::ExitOutcome;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for dockflow operations.
#[derive(Debug, Error)]
pub enum DockflowError {
    /// A host path that had to exist was missing.
    #[error("Source not found: {}", path.display())]
    SourceNotFound {
        /// The missing host path.
        path: PathBuf,
    },

    /// The mount layout would bind something unsafe into the sandbox.
    #[error("Unsafe mount configuration: {reason}")]
    UnsafeMountConfiguration {
        /// What is wrong with the layout.
        reason: String,
    },

    /// A path escapes, or is nested inside, a directory it must stay out of.
    #[error("Unsafe path nesting: {} ({reason})", path.display())]
    UnsafePathNesting {
        /// The offending path.
        path: PathBuf,
        /// Why the nesting is rejected.
        reason: String,
    },

    /// The tool or container could not be started.
    #[error("Stage '{stage}' failed to launch: {reason}")]
    StageLaunchFailure {
        /// The stage name.
        stage: String,
        /// The launch error.
        reason: String,
    },

    /// The external process finished unsuccessfully.
    #[error("Stage '{stage}' process ended with {outcome}")]
    StageProcessFailure {
        /// The stage name.
        stage: String,
        /// How the process ended.
        outcome: ExitOutcome,
        /// The last captured log lines.
        log_tail: Vec<String>,
    },

    /// The declared artifacts did not become stable within the bound.
    #[error(
        "Stage '{stage}' timed out after {polls} polls ({:.1}s) waiting for {}",
        waited.as_secs_f64(),
        display_paths(artifacts)
    )]
    StageTimeout {
        /// The stage name.
        stage: String,
        /// The artifacts that were being watched.
        artifacts: Vec<PathBuf>,
        /// Number of polls performed.
        polls: u64,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The result manifest lacks an artifact the report requires.
    #[error("Result manifest incomplete: missing {}", display_kinds(missing))]
    ManifestIncomplete {
        /// The missing artifact kinds.
        missing: Vec<ArtifactKind>,
    },

    /// The job was aborted.
    #[error("Job cancelled: {0}")]
    Cancelled(String),

    /// The stage graph is invalid.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// Another active job already owns the output directory.
    #[error("Output directory {} is already owned by job {job_id}", path.display())]
    OutputDirectoryInUse {
        /// The contested directory.
        path: PathBuf,
        /// The job currently owning it.
        job_id: String,
    },

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DockflowError {
    /// Creates a source-not-found error.
    #[must_use]
    pub fn source_not_found(path: impl Into<PathBuf>) -> Self {
        Self::SourceNotFound { path: path.into() }
    }

    /// Creates an unsafe mount configuration error.
    #[must_use]
    pub fn unsafe_mount(reason: impl Into<String>) -> Self {
        Self::UnsafeMountConfiguration {
            reason: reason.into(),
        }
    }

    /// Creates an unsafe path nesting error.
    #[must_use]
    pub fn unsafe_nesting(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::UnsafePathNesting {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a launch failure error.
    #[must_use]
    pub fn launch_failure(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StageLaunchFailure {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Creates a process failure error.
    #[must_use]
    pub fn process_failure(
        stage: impl Into<String>,
        outcome: ExitOutcome,
        log_tail: Vec<String>,
    ) -> Self {
        Self::StageProcessFailure {
            stage: stage.into(),
            outcome,
            log_tail,
        }
    }

    /// Returns a short, stable name for the error variant.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::SourceNotFound { .. } => "SourceNotFound",
            Self::UnsafeMountConfiguration { .. } => "UnsafeMountConfiguration",
            Self::UnsafePathNesting { .. } => "UnsafePathNesting",
            Self::StageLaunchFailure { .. } => "StageLaunchFailure",
            Self::StageProcessFailure { .. } => "StageProcessFailure",
            Self::StageTimeout { .. } => "StageTimeout",
            Self::ManifestIncomplete { .. } => "ManifestIncomplete",
            Self::Cancelled(_) => "Cancelled",
            Self::Validation(_) => "Validation",
            Self::OutputDirectoryInUse { .. } => "OutputDirectoryInUse",
            Self::Config(_) => "Config",
            Self::Serialization(_) => "Serialization",
            Self::Io(_) => "Io",
        }
    }

    /// Returns true for errors caused by configuration or input layout.
    ///
    /// These are terminal: resubmitting the same job fails the same way.
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::SourceNotFound { .. }
                | Self::UnsafeMountConfiguration { .. }
                | Self::UnsafePathNesting { .. }
                | Self::ManifestIncomplete { .. }
                | Self::Validation(_)
                | Self::Config(_)
        )
    }

    /// Returns true if the error is a completion-watcher timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::StageTimeout { .. })
    }

    /// Returns the captured log tail for process failures.
    #[must_use]
    pub fn log_tail(&self) -> &[String] {
        match self {
            Self::StageProcessFailure { log_tail, .. } => log_tail,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for DockflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_kinds(kinds: &[ArtifactKind]) -> String {
    kinds
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "GRAPH-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when stage graph validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "GRAPH-CYCLE",
            format!("Stage graph contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_error_info_creation() {
        let info = ContractErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "predict");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"predict".to_string()));
    }

    #[test]
    fn test_cycle_detected_error() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> a"));
        let validation: PipelineValidationError = err.into();
        assert_eq!(validation.code(), Some("GRAPH-CYCLE"));
    }

    #[test]
    fn test_configuration_errors_are_flagged() {
        assert!(DockflowError::source_not_found("/missing").is_configuration_error());
        assert!(DockflowError::unsafe_mount("nested").is_configuration_error());
        assert!(DockflowError::ManifestIncomplete { missing: vec![ArtifactKind::ScoreLog] }
            .is_configuration_error());
        assert!(!DockflowError::launch_failure("dock", "no such file").is_configuration_error());
    }

    #[test]
    fn test_timeout_display() {
        let err = DockflowError::StageTimeout {
            stage: "predict".to_string(),
            artifacts: vec![PathBuf::from("/tmp/job1/Y265H/ranked_0.pdb")],
            polls: 10,
            waited: Duration::from_secs(5),
        };

        assert!(err.is_timeout());
        let message = err.to_string();
        assert!(message.contains("10 polls"));
        assert!(message.contains("ranked_0.pdb"));
    }

    #[test]
    fn test_process_failure_keeps_log_tail() {
        let err = DockflowError::process_failure(
            "dock",
            ExitOutcome::Failure { code: Some(1) },
            vec!["Parse error on line 3".to_string()],
        );

        assert_eq!(err.error_type(), "StageProcessFailure");
        assert_eq!(err.log_tail(), ["Parse error on line 3".to_string()]);
        assert!(err.to_string().contains("exit code 1"));
    }
}
