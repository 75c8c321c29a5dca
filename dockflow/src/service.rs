//! Job submission.
//!
//! [`JobService`] runs each submitted job on its own task and guarantees
//! that at most one active job owns a given output directory.

use crate::cancellation::CancellationToken;
use crate::core::JobId;
use crate::docking::{DockingPipeline, DockingRequest};
use crate::errors::DockflowError;
use crate::mounts::absolutize;
use crate::pipeline::{Coordinator, JobOutcome, JobPlan};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Runs jobs concurrently over a shared coordinator.
#[derive(Debug, Clone)]
pub struct JobService {
    coordinator: Arc<Coordinator>,
    active: Arc<DashMap<PathBuf, JobId>>,
}

impl JobService {
    /// Creates a service.
    #[must_use]
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            active: Arc::new(DashMap::new()),
        }
    }

    /// Number of jobs still running.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.active.len()
    }

    /// Returns the job currently owning `output_dir`, if any.
    #[must_use]
    pub fn owner_of(&self, output_dir: &std::path::Path) -> Option<JobId> {
        let key = absolutize(output_dir).ok()?;
        self.active.get(&key).map(|entry| entry.value().clone())
    }

    /// Plans and submits a docking request.
    pub fn submit_request(
        &self,
        pipeline: &DockingPipeline,
        request: &DockingRequest,
    ) -> Result<JobHandle, DockflowError> {
        self.submit(pipeline.plan(request)?)
    }

    /// Starts a job.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `OutputDirectoryInUse` if another active job owns the output directory.
    pub fn submit(&self, plan: JobPlan) -> Result<JobHandle, DockflowError> {
        let key = absolutize(&plan.output_dir)?;
        let id = plan.job_id.clone();

        match self.active.entry(key.clone()) {
            Entry::Occupied(entry) => {
                warn!(
                    job_id = %id,
                    owner = %entry.get(),
                    output_dir = %key.display(),
                    "Rejected submission for an output directory in use"
                );
                return Err(DockflowError::OutputDirectoryInUse {
                    path: key,
                    job_id: entry.get().to_string(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(id.clone());
            }
        }

        let cancel = Arc::new(CancellationToken::new());
        let coordinator = Arc::clone(&self.coordinator);
        let active = Arc::clone(&self.active);
        let task_cancel = Arc::clone(&cancel);

        info!(job_id = %id, output_dir = %key.display(), "Job submitted");
        let join = tokio::spawn(async move {
            let outcome = coordinator.run(plan, &task_cancel).await;
            active.remove(&key);
            outcome
        });

        Ok(JobHandle { id, cancel, join })
    }
}

/// A submitted job.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    cancel: Arc<CancellationToken>,
    join: JoinHandle<JobOutcome>,
}

impl JobHandle {
    /// The job id.
    #[must_use]
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Aborts the job. Running stages are terminated and the job fails.
    pub fn abort(&self, reason: impl Into<String>) {
        self.cancel.cancel(reason);
    }

    /// Returns true once the job task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the job to finish.
    ///
    /// # Errors
    ///
    /// `Cancelled` if the job task itself was lost (panicked or the runtime
    /// shut down); stage failures are reported inside the outcome.
    pub async fn outcome(self) -> Result<JobOutcome, DockflowError> {
        self.join
            .await
            .map_err(|e| DockflowError::Cancelled(format!("job {} task ended: {e}", self.id)))
    }
}
