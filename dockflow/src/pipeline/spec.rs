//! Stage specifications.
//!
//! A [`StageSpec`] is pure data: what to run, which stages must finish first,
//! which host inputs it reads and which artifacts it promises to write. The
//! coordinator never inspects what a stage does beyond this description.

use crate::core::{ArtifactKind, DeclaredArtifact, StageKind};
use crate::errors::{ContractErrorInfo, DockflowError, PipelineValidationError};
use crate::mounts::{AccessMode, MountTable, PathTranslator};
use crate::runner::LaunchRequest;
use crate::watcher::WaitPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// What counts as a stage having finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSignal {
    /// The artifacts are stable. The process may keep running and is shut
    /// down once the job ends.
    Artifact,
    /// The artifacts are stable and the process exited successfully.
    #[default]
    ArtifactAndExit,
}

/// One command-line argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Passed through unchanged.
    Literal(String),
    /// A host path. Rendered as-is for plain launches and translated into the
    /// sandbox (adding a mount) for container launches.
    Path {
        /// Text placed before the path, e.g. `--output_dir=`.
        prefix: String,
        /// Mount name used when translating.
        mount: String,
        /// Host path.
        path: PathBuf,
        /// Access granted to the sandbox.
        access: AccessMode,
        /// Only the parent directory has to exist (file-name prefixes).
        prefix_only: bool,
    },
}

impl Arg {
    /// A literal argument.
    #[must_use]
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    /// A read-only path argument.
    #[must_use]
    pub fn path(mount: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::flag_path("", mount, path)
    }

    /// A read-only path argument glued to `prefix`.
    #[must_use]
    pub fn flag_path(prefix: impl Into<String>, mount: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::Path {
            prefix: prefix.into(),
            mount: mount.into(),
            path: path.into(),
            access: AccessMode::ReadOnly,
            prefix_only: false,
        }
    }

    /// Grants the sandbox write access through this argument's mount.
    #[must_use]
    pub fn writable(mut self) -> Self {
        if let Self::Path { access, .. } = &mut self {
            *access = AccessMode::ReadWrite;
        }
        self
    }

    /// Marks the path as a file-name prefix: the file itself need not exist,
    /// only its directory.
    #[must_use]
    pub fn prefix_only(mut self) -> Self {
        if let Self::Path { prefix_only, .. } = &mut self {
            *prefix_only = true;
        }
        self
    }
}

/// Container placement for an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Optional `uid[:gid]`.
    pub user: Option<String>,
}

/// An external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable (inside the container when containerized).
    pub program: String,
    /// Arguments.
    pub args: Vec<Arg>,
    /// Run inside a container when set.
    pub container: Option<ContainerSpec>,
    /// Request accelerator access.
    pub gpu: bool,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Creates a plain command.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            container: None,
            gpu: false,
            env: Vec::new(),
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    /// Appends a literal argument.
    #[must_use]
    pub fn literal(self, value: impl Into<String>) -> Self {
        self.arg(Arg::literal(value))
    }

    /// Runs the command inside `image`.
    #[must_use]
    pub fn in_container(mut self, image: impl Into<String>, user: Option<String>) -> Self {
        self.container = Some(ContainerSpec {
            image: image.into(),
            user,
        });
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

    /// Resolves the arguments into a launch request.
    ///
    /// Container launches translate every path argument through `translator`
    /// and collect the resulting mounts.
    ///
    /// # Errors
    ///
    /// `SourceNotFound` for a missing path argument (container mode), and
    /// `UnsafeMountConfiguration` for conflicting mounts.
    pub fn to_launch_request(
        &self,
        stage: &str,
        translator: &PathTranslator,
    ) -> Result<LaunchRequest, DockflowError> {
        let mut mounts = MountTable::new();
        let mut args = Vec::with_capacity(self.args.len());

        for arg in &self.args {
            match arg {
                Arg::Literal(value) => args.push(value.clone()),
                Arg::Path {
                    prefix,
                    mount,
                    path,
                    access,
                    prefix_only,
                } => {
                    let rendered = if self.container.is_some() {
                        let (entry, sandbox_path) = if *prefix_only {
                            translator.translate_prefix(mount, path, *access)?
                        } else {
                            translator.translate(mount, path, *access)?
                        };
                        mounts.insert(entry)?;
                        sandbox_path
                    } else {
                        path.clone()
                    };
                    args.push(format!("{prefix}{}", rendered.display()));
                }
            }
        }

        let mut request = LaunchRequest::new(stage, &self.program)
            .with_args(args)
            .with_mounts(mounts)
            .with_gpu(self.gpu);
        if let Some(container) = &self.container {
            request = request.in_container(&container.image, container.user.clone());
        }
        for (key, value) in &self.env {
            request = request.with_env(key, value);
        }
        Ok(request)
    }
}

/// An in-process file transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltinTransform {
    /// Copies `input` to `output` without its final line.
    StripTrailingLine {
        /// Source file.
        input: PathBuf,
        /// Destination file.
        output: PathBuf,
    },
}

impl BuiltinTransform {
    /// Runs the transform.
    ///
    /// # Errors
    ///
    /// `SourceNotFound` if the input is missing, `Io` otherwise.
    pub async fn apply(&self) -> Result<(), DockflowError> {
        match self {
            Self::StripTrailingLine { input, output } => {
                let content = match tokio::fs::read_to_string(input).await {
                    Ok(content) => content,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(DockflowError::source_not_found(input));
                    }
                    Err(e) => return Err(e.into()),
                };
                tokio::fs::write(output, strip_last_line(&content)).await?;
                Ok(())
            }
        }
    }
}

/// Drops the last line (with or without trailing newline).
fn strip_last_line(content: &str) -> &str {
    let body = content.strip_suffix('\n').unwrap_or(content);
    match body.rfind('\n') {
        Some(idx) => &content[..=idx],
        None => "",
    }
}

/// What a stage does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageAction {
    /// Launch an external process through the stage runner.
    External(CommandSpec),
    /// Run a transform in-process.
    Builtin(BuiltinTransform),
}

/// Specification for a single stage in a pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// The kind of stage.
    pub kind: StageKind,
    /// Names of stages this stage depends on.
    pub dependencies: HashSet<String>,
    /// Host paths the stage reads.
    pub inputs: Vec<PathBuf>,
    /// Artifacts the stage writes.
    pub outputs: Vec<DeclaredArtifact>,
    /// Completion bounds.
    pub wait: WaitPolicy,
    /// What counts as finished.
    pub completion: CompletionSignal,
    /// What to run.
    pub action: StageAction,
}

impl StageSpec {
    /// Creates a new stage specification.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: StageKind, action: StageAction) -> Self {
        Self {
            name: name.into(),
            kind,
            dependencies: HashSet::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            wait: WaitPolicy::default(),
            completion: CompletionSignal::default(),
            action,
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Declares a host input.
    #[must_use]
    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    /// Declares an output artifact.
    #[must_use]
    pub fn with_output(mut self, kind: ArtifactKind, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(DeclaredArtifact::new(kind, path));
        self
    }

    /// Sets the wait policy.
    #[must_use]
    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    /// Sets the completion signal.
    #[must_use]
    pub fn with_completion(mut self, completion: CompletionSignal) -> Self {
        self.completion = completion;
        self
    }

    /// Returns true if the stage runs inside a container.
    #[must_use]
    pub fn is_sandboxed(&self) -> bool {
        matches!(&self.action, StageAction::External(cmd) if cmd.container.is_some())
    }

    /// Declared output paths.
    #[must_use]
    pub fn output_paths(&self) -> Vec<PathBuf> {
        self.outputs.iter().map(|a| a.path.clone()).collect()
    }

    /// Returns true if the stage declares `path` as an output.
    #[must_use]
    pub fn produces(&self, path: &Path) -> bool {
        self.outputs.iter().any(|a| a.path == path)
    }

    /// Validates the stage specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage depends on itself or declares no
    /// outputs.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty"));
        }
        if self.dependencies.contains(&self.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.name
            ))
            .with_stages(vec![self.name.clone()]));
        }
        if self.outputs.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' declares no output artifacts",
                self.name
            ))
            .with_stages(vec![self.name.clone()])
            .with_error_info(
                ContractErrorInfo::new(
                    "CONTRACT-004-NO_OUTPUT",
                    "Completion is detected from output artifacts",
                )
                .with_fix_hint("Declare at least one output artifact for the stage."),
            ));
        }
        Ok(())
    }
}
