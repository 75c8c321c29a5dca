//! A scripted stage runner for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::DockflowError;
use crate::runner::{ExecutionControl, ExecutionRecord, ExitOutcome, LaunchRequest, StageRunner};

/// One step of a scripted stage process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Wait.
    Sleep(Duration),
    /// Replace a file's contents, creating parent directories.
    Write {
        /// Target file.
        path: PathBuf,
        /// New contents.
        contents: Vec<u8>,
    },
    /// Append to a file.
    Append {
        /// Target file.
        path: PathBuf,
        /// Appended bytes.
        contents: Vec<u8>,
    },
    /// Emit a log line.
    Log(String),
    /// Exit with a code.
    Exit(i32),
}

/// The behaviour of one stage's process.
///
/// A script without an exit step keeps running until it is terminated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageScript {
    steps: Vec<ScriptStep>,
}

impl StageScript {
    /// Creates an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A script that exits with 0 immediately.
    #[must_use]
    pub fn succeed() -> Self {
        Self::new().exit(0)
    }

    /// Adds a sleep.
    #[must_use]
    pub fn sleep(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptStep::Sleep(duration));
        self
    }

    /// Adds a file write.
    #[must_use]
    pub fn write(mut self, path: impl Into<PathBuf>, contents: impl AsRef<[u8]>) -> Self {
        self.steps.push(ScriptStep::Write {
            path: path.into(),
            contents: contents.as_ref().to_vec(),
        });
        self
    }

    /// Adds a file append.
    #[must_use]
    pub fn append(mut self, path: impl Into<PathBuf>, contents: impl AsRef<[u8]>) -> Self {
        self.steps.push(ScriptStep::Append {
            path: path.into(),
            contents: contents.as_ref().to_vec(),
        });
        self
    }

    /// Adds a log line.
    #[must_use]
    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Log(line.into()));
        self
    }

    /// Adds an exit.
    #[must_use]
    pub fn exit(mut self, code: i32) -> Self {
        self.steps.push(ScriptStep::Exit(code));
        self
    }

    /// Returns the steps.
    #[must_use]
    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }
}

/// A recorded launch.
#[derive(Debug, Clone)]
pub struct LaunchEntry {
    /// The request as received.
    pub request: LaunchRequest,
    /// When it was received.
    pub at: Instant,
}

/// A [`StageRunner`] that plays back per-stage scripts instead of spawning
/// processes.
///
/// Stages without a script exit with 0 immediately.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, StageScript>>,
    failing_launches: Mutex<HashSet<String>>,
    launches: Mutex<Vec<LaunchEntry>>,
    terminated: Arc<Mutex<Vec<String>>>,
}

impl ScriptedRunner {
    /// Creates a runner with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the script for a stage.
    #[must_use]
    pub fn with_script(self, stage: impl Into<String>, script: StageScript) -> Self {
        self.set_script(stage, script);
        self
    }

    /// Sets the script for a stage.
    pub fn set_script(&self, stage: impl Into<String>, script: StageScript) {
        self.scripts.lock().insert(stage.into(), script);
    }

    /// Makes launching `stage` fail.
    #[must_use]
    pub fn failing_launch(self, stage: impl Into<String>) -> Self {
        self.failing_launches.lock().insert(stage.into());
        self
    }

    /// Returns all recorded launches.
    #[must_use]
    pub fn launches(&self) -> Vec<LaunchEntry> {
        self.launches.lock().clone()
    }

    /// Returns launched stage names in launch order.
    #[must_use]
    pub fn launched_stages(&self) -> Vec<String> {
        self.launches
            .lock()
            .iter()
            .map(|entry| entry.request.stage.clone())
            .collect()
    }

    /// Returns the launch of `stage`, if any.
    #[must_use]
    pub fn launch_of(&self, stage: &str) -> Option<LaunchEntry> {
        self.launches
            .lock()
            .iter()
            .find(|entry| entry.request.stage == stage)
            .cloned()
    }

    /// Returns true if `stage` was launched.
    #[must_use]
    pub fn was_launched(&self, stage: &str) -> bool {
        self.launch_of(stage).is_some()
    }

    /// Returns the number of launches.
    #[must_use]
    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    /// Returns the stages whose processes were terminated.
    #[must_use]
    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().clone()
    }
}

#[async_trait]
impl StageRunner for ScriptedRunner {
    async fn launch(&self, request: &LaunchRequest) -> Result<ExecutionRecord, DockflowError> {
        self.launches.lock().push(LaunchEntry {
            request: request.clone(),
            at: Instant::now(),
        });

        if self.failing_launches.lock().contains(&request.stage) {
            return Err(DockflowError::launch_failure(
                &request.stage,
                "scripted launch failure",
            ));
        }

        let script = self
            .scripts
            .lock()
            .get(&request.stage)
            .cloned()
            .unwrap_or_else(StageScript::succeed);
        let handle = format!("scripted-{}-{}", request.stage, self.launch_count());
        let (record, control) = ExecutionRecord::channel(&request.stage, handle, 100);
        let terminated = Arc::clone(&self.terminated);
        let stage = request.stage.clone();

        tokio::spawn(async move {
            for step in script.steps {
                tokio::select! {
                    outcome = play(&step, &control) => {
                        if let Some(outcome) = outcome {
                            control.finish(outcome);
                            return;
                        }
                    }
                    () = control.termination_requested() => {
                        terminated.lock().push(stage);
                        control.finish(ExitOutcome::Killed);
                        return;
                    }
                }
            }
            control.termination_requested().await;
            terminated.lock().push(stage);
            control.finish(ExitOutcome::Killed);
        });

        Ok(record)
    }
}

async fn play(step: &ScriptStep, control: &ExecutionControl) -> Option<ExitOutcome> {
    match step {
        ScriptStep::Sleep(duration) => {
            tokio::time::sleep(*duration).await;
            None
        }
        ScriptStep::Write { path, contents } => write_file(path, contents, false, control),
        ScriptStep::Append { path, contents } => write_file(path, contents, true, control),
        ScriptStep::Log(line) => {
            control.push_line(line.clone());
            None
        }
        ScriptStep::Exit(0) => Some(ExitOutcome::Success),
        ScriptStep::Exit(code) => Some(ExitOutcome::Failure { code: Some(*code) }),
    }
}

fn write_file(
    path: &Path,
    contents: &[u8],
    append: bool,
    control: &ExecutionControl,
) -> Option<ExitOutcome> {
    match write_bytes(path, contents, append) {
        Ok(()) => None,
        Err(e) => {
            control.push_line(format!("cannot write {}: {e}", path.display()));
            Some(ExitOutcome::Failure { code: Some(1) })
        }
    }
}

fn write_bytes(path: &Path, contents: &[u8], append: bool) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test(start_paused = true)]
    async fn test_script_plays_back() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("nested").join("out.txt");
        let runner = ScriptedRunner::new().with_script(
            "convert",
            StageScript::new()
                .log("converting")
                .write(&out, "a")
                .sleep(Duration::from_secs(1))
                .append(&out, "b")
                .exit(2),
        );

        let record = runner.launch(&LaunchRequest::new("convert", "obabel")).await.unwrap();
        assert_eq!(record.wait().await, ExitOutcome::Failure { code: Some(2) });
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "ab");
        assert_eq!(record.tail(5), vec!["converting".to_string()]);
        assert_eq!(runner.launched_stages(), vec!["convert".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unscripted_stage_succeeds() {
        let runner = ScriptedRunner::new();
        let record = runner.launch(&LaunchRequest::new("dock", "vina")).await.unwrap();
        assert!(record.wait().await.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_script_without_exit_runs_until_terminated() {
        let runner = ScriptedRunner::new().with_script("predict", StageScript::new().log("running"));
        let record = runner.launch(&LaunchRequest::new("predict", "")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!record.is_finished());

        record.terminate("test");
        assert_eq!(record.wait().await, ExitOutcome::Killed);
        assert_eq!(runner.terminated(), vec!["predict".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_launch() {
        let runner = ScriptedRunner::new().failing_launch("dock");
        let err = runner.launch(&LaunchRequest::new("dock", "vina")).await.unwrap_err();
        assert!(matches!(err, DockflowError::StageLaunchFailure { .. }));
        assert_eq!(runner.launch_count(), 1);
    }
}
