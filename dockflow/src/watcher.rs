//! Completion watcher.
//!
//! External tools signal completion only by writing files. The watcher polls
//! a stage's declared artifacts at a fixed interval and declares completion
//! once every artifact exists and its size and modification time are
//! identical across two consecutive polls. The wait is bounded and can be
//! interrupted through a [`CancellationToken`].

use crate::cancellation::CancellationToken;
use crate::errors::DockflowError;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Smallest poll interval accepted.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Bounds for one watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Upper bound on the whole wait.
    pub max_wait: Duration,
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Treat zero-length files as not yet written.
    pub require_non_empty: bool,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600), Duration::from_millis(500))
    }
}

impl WaitPolicy {
    /// Creates a policy. The poll interval is clamped to at least 1ms.
    #[must_use]
    pub fn new(max_wait: Duration, poll_interval: Duration) -> Self {
        Self {
            max_wait,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            require_non_empty: true,
        }
    }

    /// Sets whether empty files count as present.
    #[must_use]
    pub fn with_require_non_empty(mut self, require: bool) -> Self {
        self.require_non_empty = require;
        self
    }

    /// Returns the same policy with `max_wait` lowered to at most `bound`.
    #[must_use]
    pub fn capped(mut self, bound: Duration) -> Self {
        self.max_wait = self.max_wait.min(bound);
        self
    }

    /// Number of polls performed before giving up.
    ///
    /// Polls happen at `0, p, 2p, ...`, so the last one lands strictly
    /// before `max_wait` (or at zero when `max_wait` is zero).
    #[must_use]
    pub fn max_polls(&self) -> u64 {
        let interval = self.poll_interval.as_nanos().max(1);
        let polls = self.max_wait.as_nanos().div_ceil(interval);
        u64::try_from(polls).unwrap_or(u64::MAX).max(1)
    }
}

/// Outcome of a successful watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchReport {
    /// Polls performed, including the confirming one.
    pub polls: u64,
    /// Time from the first poll to confirmation.
    pub waited: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileState {
    len: u64,
    modified: Option<SystemTime>,
}

/// Polls the filesystem for a set of artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionWatcher {
    policy: WaitPolicy,
}

impl CompletionWatcher {
    /// Creates a watcher with `policy`.
    #[must_use]
    pub fn new(policy: WaitPolicy) -> Self {
        Self { policy }
    }

    /// The active policy.
    #[must_use]
    pub fn policy(&self) -> &WaitPolicy {
        &self.policy
    }

    /// Waits until every artifact is present and stable.
    ///
    /// # Errors
    ///
    /// `StageTimeout` once [`WaitPolicy::max_polls`] polls passed without two
    /// identical observations, `Cancelled` if `cancel` fires first.
    pub async fn wait_for(
        &self,
        stage: &str,
        artifacts: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<WatchReport, DockflowError> {
        let started = Instant::now();
        let max_polls = self.policy.max_polls();
        let mut previous: Option<Vec<FileState>> = None;
        let mut polls = 0_u64;

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(cancel));
            }

            polls += 1;
            let current = self.observe(artifacts).await;
            trace!(stage, polls, present = current.is_some(), "Polled artifacts");

            if let (Some(now), Some(before)) = (&current, &previous) {
                if now == before {
                    let waited = started.elapsed();
                    debug!(stage, polls, waited_ms = waited.as_millis(), "Artifacts stable");
                    return Ok(WatchReport { polls, waited });
                }
            }
            previous = current;

            if polls >= max_polls {
                return Err(DockflowError::StageTimeout {
                    stage: stage.to_string(),
                    artifacts: artifacts.to_vec(),
                    polls,
                    waited: started.elapsed(),
                });
            }

            tokio::select! {
                () = tokio::time::sleep(self.policy.poll_interval) => {}
                () = cancel.cancelled() => return Err(cancelled(cancel)),
            }
        }
    }

    /// Checks once whether every artifact is already present and stable.
    ///
    /// Takes two observations one poll interval apart.
    ///
    /// # Errors
    ///
    /// `Cancelled` if `cancel` fires before the second observation.
    pub async fn probe_stable(
        &self,
        artifacts: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<bool, DockflowError> {
        if cancel.is_cancelled() {
            return Err(cancelled(cancel));
        }
        let Some(first) = self.observe(artifacts).await else {
            return Ok(false);
        };
        tokio::select! {
            () = tokio::time::sleep(self.policy.poll_interval) => {}
            () = cancel.cancelled() => return Err(cancelled(cancel)),
        }
        Ok(self
            .observe(artifacts)
            .await
            .is_some_and(|second| second == first))
    }

    /// Returns every artifact's state, or `None` if any is absent.
    async fn observe(&self, artifacts: &[PathBuf]) -> Option<Vec<FileState>> {
        let mut states = Vec::with_capacity(artifacts.len());
        for path in artifacts {
            states.push(self.file_state(path).await?);
        }
        Some(states)
    }

    async fn file_state(&self, path: &Path) -> Option<FileState> {
        let metadata = tokio::fs::metadata(path).await.ok()?;
        if !metadata.is_file() {
            return None;
        }
        if self.policy.require_non_empty && metadata.len() == 0 {
            return None;
        }
        Some(FileState {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

fn cancelled(cancel: &CancellationToken) -> DockflowError {
    DockflowError::Cancelled(cancel.reason().unwrap_or_else(|| "cancelled".to_string()))
}
