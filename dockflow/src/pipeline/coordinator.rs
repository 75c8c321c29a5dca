//! The pipeline coordinator.
//!
//! Drives one job through its stage graph: preflight checks, scheduling of
//! stages whose dependencies have completed, completion detection through the
//! watcher, failure propagation, and report generation. Stages are scheduled
//! as soon as their in-degree reaches zero, the same way the stage graph
//! executor works, with an optional limit of one stage at a time.

use super::{CompletionSignal, PipelineBuilder, StageAction, StageGraph, StageSpec};
use crate::cancellation::CancellationToken;
use crate::core::{
    FailureRecord, Job, JobId, JobState, JobStatus, ResultManifest, StageKind, StageStatus,
};
use crate::errors::DockflowError;
use crate::events::{event_types, EventSink, NoOpEventSink};
use crate::mounts::{absolutize, resolve_source, PathTranslator};
use crate::observability::{SpanTimer, StageSpanAttributes};
use crate::pipeline::spec::{BuiltinTransform, CommandSpec};
use crate::report::{self, ReportSpec};
use crate::runner::{ExecutionRecord, StageRunner};
use crate::watcher::CompletionWatcher;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Directory under the output directory holding coordinator state.
pub const STATE_DIR: &str = ".dockflow";
/// File name of the persisted job record.
pub const JOB_FILE: &str = "job.json";

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Whether independent stages may overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPolicy {
    /// Independent stages run concurrently.
    #[default]
    Concurrent,
    /// One stage at a time, in topological order.
    Sequential,
}

impl ExecutionPolicy {
    fn limit(self) -> usize {
        match self {
            Self::Concurrent => usize::MAX,
            Self::Sequential => 1,
        }
    }
}

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Scheduling policy.
    pub policy: ExecutionPolicy,
    /// How long artifacts may take to settle after a successful exit.
    pub exit_grace: Duration,
    /// How long detached processes may keep running after the job succeeds.
    pub shutdown_grace: Duration,
    /// Log lines kept in failure records.
    pub log_tail_lines: usize,
    /// Write `job.json` into the output directory.
    pub persist_state: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            policy: ExecutionPolicy::default(),
            exit_grace: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(60),
            log_tail_lines: 20,
            persist_state: true,
        }
    }
}

impl CoordinatorOptions {
    /// Sets the scheduling policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the exit grace period.
    #[must_use]
    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets the number of log lines kept on failure.
    #[must_use]
    pub fn with_log_tail_lines(mut self, lines: usize) -> Self {
        self.log_tail_lines = lines;
        self
    }

    /// Enables or disables `job.json` persistence.
    #[must_use]
    pub fn with_persist_state(mut self, persist: bool) -> Self {
        self.persist_state = persist;
        self
    }
}

/// Installation and data directories of a containerized tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountLayout {
    /// Where the tool is installed.
    pub install_dir: PathBuf,
    /// Where its reference data lives.
    pub data_dir: PathBuf,
}

/// Everything needed to run one job.
#[derive(Debug, Clone)]
pub struct JobPlan {
    /// Job identifier.
    pub job_id: JobId,
    /// Output directory owned by the job.
    pub output_dir: PathBuf,
    /// Stages to run; validated during preflight.
    pub pipeline: PipelineBuilder,
    /// Report destination and inputs.
    pub report: ReportSpec,
    /// Directories the output directory must not be nested in.
    pub protected_dirs: Vec<PathBuf>,
    /// Mount layout to check before launching anything.
    pub mount_layout: Option<MountLayout>,
}

impl JobPlan {
    /// Creates a plan.
    #[must_use]
    pub fn new(
        job_id: JobId,
        output_dir: impl Into<PathBuf>,
        pipeline: PipelineBuilder,
        report: ReportSpec,
    ) -> Self {
        Self {
            job_id,
            output_dir: output_dir.into(),
            pipeline,
            report,
            protected_dirs: Vec::new(),
            mount_layout: None,
        }
    }

    /// Forbids nesting the output directory inside `dir`.
    #[must_use]
    pub fn with_protected_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.protected_dirs.push(dir.into());
        self
    }

    /// Sets the mount layout to validate.
    #[must_use]
    pub fn with_mount_layout(mut self, install_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        self.mount_layout = Some(MountLayout {
            install_dir: install_dir.into(),
            data_dir: data_dir.into(),
        });
        self
    }
}

/// Final state of a job.
#[derive(Debug)]
pub struct JobOutcome {
    /// The job record, in a terminal state.
    pub job: Job,
    /// The manifest on success, the error that ended the job otherwise.
    pub result: Result<ResultManifest, DockflowError>,
    /// Path of the written report.
    pub report: Option<PathBuf>,
}

impl JobOutcome {
    /// Returns true if the job succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.job.status() == JobStatus::Succeeded
    }

    /// Returns the coarse job status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.job.status()
    }

    /// Converts into the manifest or the error.
    ///
    /// # Errors
    ///
    /// The error that ended the job.
    pub fn into_result(self) -> Result<ResultManifest, DockflowError> {
        self.result
    }
}

struct StageFailure {
    stage: Option<(String, StageKind)>,
    error: DockflowError,
}

enum StageCompletion {
    Ran,
    Skipped,
    /// Artifacts are confirmed but the process is still running.
    Detached(ExecutionRecord),
}

/// Sequences stages over a job's graph.
pub struct Coordinator {
    runner: Arc<dyn StageRunner>,
    translator: PathTranslator,
    events: Arc<dyn EventSink>,
    options: CoordinatorOptions,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("runner", &self.runner)
            .field("translator", &self.translator)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Creates a coordinator launching stages through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn StageRunner>) -> Self {
        Self {
            runner,
            translator: PathTranslator::default(),
            events: Arc::new(NoOpEventSink),
            options: CoordinatorOptions::default(),
        }
    }

    /// Sets the path translator for sandboxed stages.
    #[must_use]
    pub fn with_translator(mut self, translator: PathTranslator) -> Self {
        self.translator = translator;
        self
    }

    /// Sets the lifecycle event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the options.
    #[must_use]
    pub fn with_options(mut self, options: CoordinatorOptions) -> Self {
        self.options = options;
        self
    }

    /// The active options.
    #[must_use]
    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Runs a job to completion.
    ///
    /// Never returns early: the outcome always carries a job in a terminal
    /// state. Cancelling `cancel` terminates running stages and fails the
    /// job.
    pub async fn run(&self, plan: JobPlan, cancel: &CancellationToken) -> JobOutcome {
        let span = info_span!("job", job_id = %plan.job_id);
        self.run_job(plan, cancel).instrument(span).await
    }

    async fn run_job(&self, plan: JobPlan, cancel: &CancellationToken) -> JobOutcome {
        let JobPlan {
            job_id,
            output_dir,
            pipeline,
            report,
            protected_dirs,
            mount_layout,
        } = plan;
        let mut job = Job::new(job_id, &output_dir);
        info!(
            output_dir = %output_dir.display(),
            stages = pipeline.stage_count(),
            "Job accepted"
        );

        let preflight = self
            .preflight(job.id(), &output_dir, pipeline, &report, &protected_dirs, mount_layout.as_ref())
            .await;
        let (graph, manifest) = match preflight {
            Ok(checked) => checked,
            Err(error) => {
                let error = self.fail(&mut job, StageFailure { stage: None, error });
                return JobOutcome {
                    job,
                    result: Err(error),
                    report: None,
                };
            }
        };
        self.persist(&job);

        let token = cancel.child();
        let detached = match self.schedule(&mut job, &graph, &token).await {
            Ok(detached) => detached,
            Err(mut failure) => {
                if matches!(failure.error, DockflowError::Cancelled(_)) && cancel.is_cancelled() {
                    failure.error =
                        DockflowError::Cancelled(cancel.reason().unwrap_or_default());
                }
                let error = self.fail(&mut job, failure);
                return JobOutcome {
                    job,
                    result: Err(error),
                    report: None,
                };
            }
        };

        self.set_state(&mut job, JobState::Reporting);
        match report::write_report(&report, &manifest).await {
            Ok(path) => {
                self.events.try_emit(
                    event_types::REPORT_WRITTEN,
                    serde_json::json!({
                        "job_id": job.id(),
                        "path": path,
                    }),
                );
                self.set_state(&mut job, JobState::Succeeded);
                info!(report = %path.display(), "Job succeeded");
                self.shutdown_detached(detached, cancel).await;
                JobOutcome {
                    job,
                    result: Ok(manifest),
                    report: Some(path),
                }
            }
            Err(error) => {
                self.stop_all(&detached, "report generation failed").await;
                let error = self.fail(&mut job, StageFailure { stage: None, error });
                JobOutcome {
                    job,
                    result: Err(error),
                    report: None,
                }
            }
        }
    }

    /// Validates everything that can be checked before launching a stage and
    /// returns the graph with the manifest its outputs will fill.
    async fn preflight(
        &self,
        job_id: &JobId,
        output_dir: &Path,
        pipeline: PipelineBuilder,
        report: &ReportSpec,
        protected_dirs: &[PathBuf],
        mount_layout: Option<&MountLayout>,
    ) -> Result<(StageGraph, ResultManifest), DockflowError> {
        let graph = pipeline.build()?;

        let mut manifest = ResultManifest::new(job_id.clone(), output_dir);
        for spec in graph.stages() {
            manifest.extend(&spec.outputs);
        }
        manifest.validate()?;

        if let Some(layout) = mount_layout {
            PathTranslator::check_layout(&layout.install_dir, &layout.data_dir)?;
        }

        let out = absolutize(output_dir)?;
        for dir in protected_dirs {
            let dir = absolutize(dir)?;
            if out.starts_with(&dir) {
                return Err(DockflowError::unsafe_nesting(
                    &out,
                    format!("output directory is inside {}", dir.display()),
                ));
            }
        }

        let declared = graph
            .stages()
            .flat_map(|spec| spec.outputs.iter().map(move |a| (spec.name.as_str(), &a.path)))
            .chain(std::iter::once(("report", &report.path)));
        for (owner, path) in declared {
            let path = absolutize(path)?;
            if path == out || !path.starts_with(&out) {
                return Err(DockflowError::unsafe_nesting(
                    path,
                    format!("artifact of '{owner}' is outside the output directory"),
                ));
            }
        }

        for input in graph.external_inputs() {
            resolve_source(&input)?;
        }

        tokio::fs::create_dir_all(&out).await?;
        debug!(stages = ?graph.execution_order(), "Preflight passed");
        Ok((graph, manifest))
    }

    /// Runs the graph. Returns records of processes still running after
    /// their artifacts were confirmed.
    async fn schedule(
        &self,
        job: &mut Job,
        graph: &StageGraph,
        token: &Arc<CancellationToken>,
    ) -> Result<Vec<ExecutionRecord>, StageFailure> {
        let limit = self.options.policy.limit();
        let mut in_degree = graph.in_degrees();
        let mut ready: VecDeque<&StageSpec> = graph
            .stages()
            .filter(|spec| spec.dependencies.is_empty())
            .collect();
        let mut active = FuturesUnordered::new();
        let mut detached = Vec::new();
        let mut failure: Option<StageFailure> = None;

        loop {
            if failure.is_none() && token.is_cancelled() {
                failure = Some(StageFailure {
                    stage: None,
                    error: DockflowError::Cancelled(token.reason().unwrap_or_default()),
                });
            }

            while failure.is_none() && active.len() < limit {
                let Some(spec) = ready.pop_front() else {
                    break;
                };
                self.set_state(job, spec.kind.job_state());
                let span = info_span!("stage", stage = %spec.name, kind = %spec.kind);
                active.push(
                    self.run_stage(job.id().clone(), spec, Arc::clone(token))
                        .instrument(span),
                );
            }

            let Some((spec, result)) = active.next().await else {
                break;
            };

            match result {
                Ok(completion) => {
                    if let StageCompletion::Detached(record) = completion {
                        detached.push(record);
                    }
                    if failure.is_some() {
                        continue;
                    }
                    for dependent in graph.dependents(&spec.name) {
                        if let Some(count) = in_degree.get_mut(dependent) {
                            *count = count.saturating_sub(1);
                            if *count == 0 {
                                if let Some(next) = graph.stage(dependent) {
                                    ready.push_back(next);
                                }
                            }
                        }
                    }
                }
                Err(error) => {
                    if failure.is_none() {
                        token.cancel(format!("stage '{}' failed", spec.name));
                        failure = Some(StageFailure {
                            stage: Some((spec.name.clone(), spec.kind)),
                            error,
                        });
                    }
                }
            }
        }

        if let Some(failure) = failure {
            self.stop_all(&detached, "job failed").await;
            return Err(failure);
        }
        Ok(detached)
    }

    async fn run_stage<'a>(
        &'a self,
        job_id: JobId,
        spec: &'a StageSpec,
        cancel: Arc<CancellationToken>,
    ) -> (&'a StageSpec, Result<StageCompletion, DockflowError>) {
        let outputs = spec.output_paths();
        let watcher = CompletionWatcher::new(spec.wait);
        let attrs = StageSpanAttributes::new(job_id.as_str(), &spec.name, spec.kind)
            .with_artifacts(outputs.clone());

        match watcher.probe_stable(&outputs, &cancel).await {
            Ok(true) => {
                info!("Artifacts already present, skipping stage");
                self.events.try_emit(
                    event_types::STAGE_SKIPPED,
                    attrs.with_status(StageStatus::Skip).to_payload(),
                );
                return (spec, Ok(StageCompletion::Skipped));
            }
            Ok(false) => {}
            Err(error) => return (spec, Err(error)),
        }

        self.events.try_emit(
            event_types::STAGE_STARTED,
            attrs.clone().with_status(StageStatus::Running).to_payload(),
        );
        let timer = SpanTimer::start(&spec.name);

        let result = match &spec.action {
            StageAction::Builtin(transform) => self
                .run_builtin(spec, transform, &watcher, &outputs, &cancel)
                .await
                .map(|()| StageCompletion::Ran),
            StageAction::External(command) => {
                self.run_external(spec, command, &watcher, &outputs, &cancel)
                    .await
            }
        };

        let duration_ms = timer.finish();
        match &result {
            Ok(_) => {
                info!(duration_ms, "Stage completed");
                self.events.try_emit(
                    event_types::STAGE_COMPLETED,
                    attrs
                        .with_status(StageStatus::Ok)
                        .with_duration_ms(duration_ms)
                        .to_payload(),
                );
            }
            Err(error) => {
                let status = if matches!(error, DockflowError::Cancelled(_)) {
                    StageStatus::Cancel
                } else {
                    StageStatus::Fail
                };
                warn!(error = %error, duration_ms, "Stage did not complete");
                self.events.try_emit(
                    event_types::STAGE_FAILED,
                    attrs
                        .with_status(status)
                        .with_duration_ms(duration_ms)
                        .with_error(error.to_string())
                        .to_payload(),
                );
            }
        }

        (spec, result)
    }

    async fn run_builtin(
        &self,
        spec: &StageSpec,
        transform: &BuiltinTransform,
        watcher: &CompletionWatcher,
        outputs: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<(), DockflowError> {
        tokio::select! {
            result = transform.apply() => result?,
            () = cancel.cancelled() => return Err(cancelled(cancel)),
        }
        watcher.wait_for(&spec.name, outputs, cancel).await?;
        Ok(())
    }

    async fn run_external(
        &self,
        spec: &StageSpec,
        command: &CommandSpec,
        watcher: &CompletionWatcher,
        outputs: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<StageCompletion, DockflowError> {
        let request = command.to_launch_request(&spec.name, &self.translator)?;
        let record = self.runner.launch(&request).await?;
        let started = Instant::now();
        let tail = self.options.log_tail_lines;

        let watch = watcher.wait_for(&spec.name, outputs, cancel);
        tokio::pin!(watch);

        let confirmed = tokio::select! {
            result = &mut watch => result,
            outcome = record.wait() => {
                if !outcome.is_success() {
                    return Err(DockflowError::process_failure(&spec.name, outcome, record.tail(tail)));
                }
                debug!("Process exited, waiting for artifacts to settle");
                let remaining = spec.wait.max_wait.saturating_sub(started.elapsed());
                let grace = spec.wait.capped(self.options.exit_grace.min(remaining));
                CompletionWatcher::new(grace)
                    .wait_for(&spec.name, outputs, cancel)
                    .await
            }
        };

        let report = match confirmed {
            Ok(report) => report,
            Err(error) => {
                self.stop(&record, error.to_string()).await;
                return Err(error);
            }
        };
        debug!(polls = report.polls, "Artifacts confirmed");

        match record.outcome() {
            Some(outcome) if !outcome.is_success() => {
                return Err(DockflowError::process_failure(&spec.name, outcome, record.tail(tail)));
            }
            Some(_) => return Ok(StageCompletion::Ran),
            None => {}
        }

        match spec.completion {
            CompletionSignal::Artifact => Ok(StageCompletion::Detached(record)),
            CompletionSignal::ArtifactAndExit => {
                let remaining = spec.wait.max_wait.saturating_sub(started.elapsed());
                tokio::select! {
                    outcome = record.wait() => {
                        if outcome.is_success() {
                            Ok(StageCompletion::Ran)
                        } else {
                            Err(DockflowError::process_failure(&spec.name, outcome, record.tail(tail)))
                        }
                    }
                    () = tokio::time::sleep(remaining) => {
                        self.stop(&record, "process outlived its wait bound").await;
                        Err(DockflowError::StageTimeout {
                            stage: spec.name.clone(),
                            artifacts: outputs.to_vec(),
                            polls: report.polls,
                            waited: started.elapsed(),
                        })
                    }
                    () = cancel.cancelled() => {
                        self.stop(&record, "job cancelled").await;
                        Err(cancelled(cancel))
                    }
                }
            }
        }
    }

    /// Lets detached processes finish, terminating them after the grace or
    /// as soon as `cancel` fires.
    async fn shutdown_detached(&self, records: Vec<ExecutionRecord>, cancel: &CancellationToken) {
        let grace = self.options.shutdown_grace;
        let shutdowns = records.iter().map(|record| async move {
            tokio::select! {
                _ = record.wait() => {}
                () = tokio::time::sleep(grace) => {
                    info!(
                        stage = record.stage(),
                        handle = record.handle(),
                        "Terminating stage process after shutdown grace"
                    );
                    self.stop(record, "shutdown grace elapsed").await;
                }
                () = cancel.cancelled() => {
                    info!(
                        stage = record.stage(),
                        handle = record.handle(),
                        "Terminating stage process on abort"
                    );
                    self.stop(record, cancelled(cancel).to_string()).await;
                }
            }
        });
        futures::future::join_all(shutdowns).await;
    }

    /// Requests termination and waits (bounded) for the process to exit.
    async fn stop(&self, record: &ExecutionRecord, reason: impl Into<String>) {
        if record.is_finished() {
            return;
        }
        record.terminate(reason);
        let grace = self.options.exit_grace.max(STOP_GRACE);
        if tokio::time::timeout(grace, record.wait()).await.is_err() {
            warn!(
                stage = record.stage(),
                handle = record.handle(),
                "Stage process did not exit after termination"
            );
        }
    }

    async fn stop_all(&self, records: &[ExecutionRecord], reason: &str) {
        futures::future::join_all(records.iter().map(|record| self.stop(record, reason))).await;
    }

    fn set_state(&self, job: &mut Job, next: JobState) {
        let from = job.state();
        if from != next && job.transition(next) {
            self.state_changed(job, from);
        }
    }

    fn fail(&self, job: &mut Job, failure: StageFailure) -> DockflowError {
        let StageFailure { stage, error } = failure;
        let record = FailureRecord::from_error(
            stage.as_ref().map(|(name, kind)| (name.as_str(), *kind)),
            &error,
        );
        let from = job.state();
        job.fail(record, error.is_timeout());
        error!(
            stage = stage.as_ref().map_or("-", |(name, _)| name.as_str()),
            error_type = error.error_type(),
            error = %error,
            "Job {}",
            job.state()
        );
        self.state_changed(job, from);
        error
    }

    fn state_changed(&self, job: &Job, from: JobState) {
        if job.state() == from {
            return;
        }
        debug!(from = %from, to = %job.state(), "Job state changed");
        self.events.try_emit(
            event_types::JOB_STATE_CHANGED,
            serde_json::json!({
                "job_id": job.id(),
                "from": from,
                "to": job.state(),
            }),
        );
        self.persist(job);
    }

    /// Writes `job.json` if the output directory exists.
    fn persist(&self, job: &Job) {
        if !self.options.persist_state || !job.output_dir().is_dir() {
            return;
        }
        if let Err(e) = write_job_file(job) {
            warn!(error = %e, "Failed to persist job state");
        }
    }
}

fn write_job_file(job: &Job) -> Result<(), DockflowError> {
    let dir = job.output_dir().join(STATE_DIR);
    std::fs::create_dir_all(&dir)?;
    let tmp = dir.join(format!("{JOB_FILE}.tmp"));
    std::fs::write(&tmp, serde_json::to_vec_pretty(job)?)?;
    std::fs::rename(&tmp, dir.join(JOB_FILE))?;
    Ok(())
}

fn cancelled(cancel: &CancellationToken) -> DockflowError {
    DockflowError::Cancelled(cancel.reason().unwrap_or_else(|| "cancelled".to_string()))
}
