//! Execution records and the runner-side control handle.

use super::ExitOutcome;
use crate::cancellation::CancellationToken;
use crate::core::Timestamp;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

/// Bounded buffer keeping the most recent log lines of a process.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl LogBuffer {
    /// Creates a buffer retaining at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Appends a line, evicting the oldest when full.
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Returns the last `n` lines, oldest first.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    /// Returns every retained line.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

/// Observer side of a launched process.
///
/// Dropping a record whose process has not finished requests termination,
/// so an abandoned stage cannot outlive the job.
#[derive(Debug)]
pub struct ExecutionRecord {
    stage: String,
    handle: String,
    started_at: Timestamp,
    logs: Arc<LogBuffer>,
    outcome: watch::Receiver<Option<ExitOutcome>>,
    kill: Arc<CancellationToken>,
}

/// Runner side of a launched process.
#[derive(Debug)]
pub struct ExecutionControl {
    logs: Arc<LogBuffer>,
    outcome: watch::Sender<Option<ExitOutcome>>,
    kill: Arc<CancellationToken>,
}

impl ExecutionRecord {
    /// Creates a connected record/control pair.
    ///
    /// `handle` identifies the process (pid or container name) in logs.
    #[must_use]
    pub fn channel(
        stage: impl Into<String>,
        handle: impl Into<String>,
        log_capacity: usize,
    ) -> (Self, ExecutionControl) {
        let logs = Arc::new(LogBuffer::new(log_capacity));
        let kill = Arc::new(CancellationToken::new());
        let (tx, rx) = watch::channel(None);

        let record = Self {
            stage: stage.into(),
            handle: handle.into(),
            started_at: Utc::now(),
            logs: Arc::clone(&logs),
            outcome: rx,
            kill: Arc::clone(&kill),
        };
        let control = ExecutionControl {
            logs,
            outcome: tx,
            kill,
        };
        (record, control)
    }

    /// The stage this process belongs to.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// The process or container handle.
    #[must_use]
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// When the process was started.
    #[must_use]
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// The exit outcome, if the process has finished.
    #[must_use]
    pub fn outcome(&self) -> Option<ExitOutcome> {
        *self.outcome.borrow()
    }

    /// Returns true once the exit outcome is known.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.outcome().is_some()
    }

    /// Waits for the process to finish.
    ///
    /// Resolves to `Unknown` if the runner went away without reporting.
    pub async fn wait(&self) -> ExitOutcome {
        let mut rx = self.outcome.clone();
        let result = rx.wait_for(Option::is_some).await;
        match result {
            Ok(outcome) => (*outcome).unwrap_or(ExitOutcome::Unknown),
            Err(_) => ExitOutcome::Unknown,
        }
    }

    /// Requests termination of the process.
    pub fn terminate(&self, reason: impl Into<String>) {
        self.kill.cancel(reason);
    }

    /// Returns true once termination has been requested.
    #[must_use]
    pub fn termination_requested(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// The last `n` captured log lines.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<String> {
        self.logs.tail(n)
    }
}

impl Drop for ExecutionRecord {
    fn drop(&mut self) {
        if !self.is_finished() {
            self.kill.cancel("execution record dropped");
        }
    }
}

impl ExecutionControl {
    /// Captures one log line.
    pub fn push_line(&self, line: impl Into<String>) {
        self.logs.push(line);
    }

    /// Shared handle on the log buffer for output pumps.
    #[must_use]
    pub fn logs(&self) -> Arc<LogBuffer> {
        Arc::clone(&self.logs)
    }

    /// Publishes the exit outcome.
    pub fn finish(&self, outcome: ExitOutcome) {
        self.outcome.send_replace(Some(outcome));
    }

    /// Resolves once the record asks for termination.
    pub async fn termination_requested(&self) {
        self.kill.cancelled().await;
    }

    /// Returns true if termination was requested.
    #[must_use]
    pub fn is_termination_requested(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// The termination reason, if any.
    #[must_use]
    pub fn termination_reason(&self) -> Option<String> {
        self.kill.reason()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_log_buffer_keeps_tail() {
        let buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {i}"));
        }

        assert_eq!(buffer.lines(), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buffer.tail(2), vec!["line 3", "line 4"]);
        assert_eq!(buffer.tail(10).len(), 3);
    }

    #[tokio::test]
    async fn test_wait_resolves_on_finish() {
        let (record, control) = ExecutionRecord::channel("dock", "1234", 10);
        assert!(!record.is_finished());

        let waiter = tokio::spawn(async move {
            let outcome = record.wait().await;
            (outcome, record.tail(1))
        });

        control.push_line("Writing output ... done.");
        control.finish(ExitOutcome::Success);

        let (outcome, tail) = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ExitOutcome::Success);
        assert_eq!(tail, vec!["Writing output ... done."]);
    }

    #[tokio::test]
    async fn test_wait_unknown_when_runner_gone() {
        let (record, control) = ExecutionRecord::channel("dock", "1234", 10);
        drop(control);
        assert_eq!(record.wait().await, ExitOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_terminate_reaches_control() {
        let (record, control) = ExecutionRecord::channel("predict", "dockflow-predict", 10);
        record.terminate("job aborted");

        control.termination_requested().await;
        assert_eq!(control.termination_reason(), Some("job aborted".to_string()));
    }

    #[test]
    fn test_drop_unfinished_requests_termination() {
        let (record, control) = ExecutionRecord::channel("predict", "dockflow-predict", 10);
        drop(record);
        assert!(control.is_termination_requested());
    }

    #[test]
    fn test_drop_finished_is_quiet() {
        let (record, control) = ExecutionRecord::channel("convert", "42", 10);
        control.finish(ExitOutcome::Success);
        drop(record);
        assert!(!control.is_termination_requested());
    }
}
