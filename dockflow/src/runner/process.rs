//! Host process runner backed by `tokio::process`.

use super::{ExecutionControl, ExecutionMode, ExecutionRecord, ExitOutcome, LaunchRequest, StageRunner};
use crate::errors::DockflowError;
use crate::runner::LogBuffer;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default number of log lines kept per process.
pub const DEFAULT_LOG_CAPACITY: usize = 200;

/// How long output pumps may keep draining after the process exits.
const PUMP_DRAIN: Duration = Duration::from_secs(2);

/// Launches stages as host processes, optionally through a container CLI.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    container_cli: String,
    log_capacity: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            container_cli: "docker".to_string(),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl ProcessRunner {
    /// Creates a runner using `docker` for container launches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the container CLI (e.g. `podman`).
    #[must_use]
    pub fn with_container_cli(mut self, cli: impl Into<String>) -> Self {
        self.container_cli = cli.into();
        self
    }

    /// Sets the number of log lines retained per process.
    #[must_use]
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Builds the program and argument vector for `request`.
    ///
    /// `container_name` names the container so it can be killed later; it is
    /// unused for plain launches.
    #[must_use]
    pub fn command_line(&self, request: &LaunchRequest, container_name: &str) -> (String, Vec<String>) {
        match &request.mode {
            ExecutionMode::Plain => (request.program.clone(), request.args.clone()),
            ExecutionMode::Container { image, user } => {
                let mut args = vec![
                    "run".to_string(),
                    "--rm".to_string(),
                    "--name".to_string(),
                    container_name.to_string(),
                ];
                for entry in &request.mounts {
                    args.push("-v".to_string());
                    args.push(entry.volume_spec());
                }
                if request.gpu {
                    args.push("--gpus".to_string());
                    args.push("all".to_string());
                }
                for (key, value) in &request.env {
                    args.push("-e".to_string());
                    args.push(format!("{key}={value}"));
                }
                if let Some(user) = user {
                    args.push("--user".to_string());
                    args.push(user.clone());
                }
                args.push(image.clone());
                if !request.program.is_empty() {
                    args.push(request.program.clone());
                }
                args.extend(request.args.iter().cloned());
                (self.container_cli.clone(), args)
            }
        }
    }
}

#[async_trait]
impl StageRunner for ProcessRunner {
    async fn launch(&self, request: &LaunchRequest) -> Result<ExecutionRecord, DockflowError> {
        let container_name = format!(
            "dockflow-{}-{}",
            sanitize(&request.stage),
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        );
        let (program, args) = self.command_line(request, &container_name);

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !request.is_container() {
            command.envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            if let Some(dir) = &request.working_dir {
                command.current_dir(dir);
            }
        }

        let mut child = command.spawn().map_err(|e| {
            DockflowError::launch_failure(&request.stage, format!("{program}: {e}"))
        })?;

        let handle = if request.is_container() {
            container_name.clone()
        } else {
            child.id().map_or_else(|| "exited".to_string(), |pid| pid.to_string())
        };
        info!(stage = %request.stage, handle = %handle, program = %program, "Launched stage process");

        let (record, control) = ExecutionRecord::channel(&request.stage, &handle, self.log_capacity);

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(request.stage.clone(), "stdout", stdout, control.logs()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(request.stage.clone(), "stderr", stderr, control.logs()));
        }

        let kill_target = request
            .is_container()
            .then(|| (self.container_cli.clone(), container_name));
        tokio::spawn(supervise(request.stage.clone(), child, control, pumps, kill_target));

        Ok(record)
    }
}

fn spawn_pump<R>(stage: String, stream: &'static str, reader: R, logs: Arc<LogBuffer>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(stage = %stage, stream, "{}", line);
                    logs.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(stage = %stage, stream, error = %e, "Stopped reading stage output");
                    break;
                }
            }
        }
    })
}

async fn supervise(
    stage: String,
    mut child: Child,
    control: ExecutionControl,
    pumps: Vec<JoinHandle<()>>,
    kill_target: Option<(String, String)>,
) {
    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ExitOutcome::from(status),
            Err(e) => {
                warn!(stage = %stage, error = %e, "Failed to wait for stage process");
                ExitOutcome::Unknown
            }
        },
        () = control.termination_requested() => {
            info!(
                stage = %stage,
                reason = control.termination_reason().as_deref().unwrap_or("unspecified"),
                "Terminating stage process"
            );
            if let Some((cli, name)) = &kill_target {
                kill_container(cli, name).await;
            }
            if let Err(e) = child.start_kill() {
                debug!(stage = %stage, error = %e, "Process already gone");
            }
            if let Err(e) = child.wait().await {
                debug!(stage = %stage, error = %e, "Failed to reap killed process");
            }
            ExitOutcome::Killed
        }
    };

    if tokio::time::timeout(PUMP_DRAIN, futures::future::join_all(pumps))
        .await
        .is_err()
    {
        debug!(stage = %stage, "Output pumps still open after exit");
    }

    debug!(stage = %stage, outcome = %outcome, "Stage process finished");
    control.finish(outcome);
}

async fn kill_container(cli: &str, name: &str) {
    let result = Command::new(cli)
        .args(["kill", name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => debug!(container = name, "Container killed"),
        Ok(status) => debug!(container = name, status = %status, "Container kill returned non-zero"),
        Err(e) => warn!(container = name, error = %e, "Failed to run container kill"),
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}
