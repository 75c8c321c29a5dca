//! Configuration loading for dockflow.
//! Reads `dockflow.toml` from a given path or from the path in the
//! `DOCKFLOW_CONFIG` environment variable. Every field has a default.

use crate::errors::DockflowError;
use crate::observability::LogFormat;
use crate::pipeline::{CoordinatorOptions, ExecutionPolicy};
use crate::watcher::WaitPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "DOCKFLOW_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Coordinator and runner settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Structure predictor settings.
    #[serde(default)]
    pub predictor: PredictorConfig,
    /// Ligand converter settings.
    #[serde(default)]
    pub converter: ConverterConfig,
    /// Docking engine settings.
    #[serde(default)]
    pub docking: DockingConfig,
}

impl Config {
    /// Parses a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, DockflowError> {
        let config: Self =
            toml::from_str(text).map_err(|e| DockflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file.
    pub fn load(path: &Path) -> Result<Self, DockflowError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DockflowError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    /// Loads the file named by `DOCKFLOW_CONFIG`, or the defaults if unset.
    pub fn from_env() -> Result<Self, DockflowError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Rejects values that cannot be turned into durations or launches.
    pub fn validate(&self) -> Result<(), DockflowError> {
        let seconds = [
            ("runtime.shutdown_grace_seconds", self.runtime.shutdown_grace_seconds),
            ("runtime.exit_grace_seconds", self.runtime.exit_grace_seconds),
            ("runtime.poll_interval_seconds", self.runtime.poll_interval_seconds),
            ("predictor.max_wait_seconds", self.predictor.max_wait_seconds),
            ("converter.max_wait_seconds", self.converter.max_wait_seconds),
            ("docking.max_wait_seconds", self.docking.max_wait_seconds),
        ];
        for (key, value) in seconds {
            if !value.is_finite() || value < 0.0 {
                return Err(DockflowError::Config(format!(
                    "{key} must be a non-negative number of seconds, got {value}"
                )));
            }
        }
        if self.runtime.poll_interval_seconds == 0.0 {
            return Err(DockflowError::Config(
                "runtime.poll_interval_seconds must be positive".to_string(),
            ));
        }
        for (key, value) in [
            ("runtime.container_cli", &self.runtime.container_cli),
            ("predictor.image", &self.predictor.image),
            ("converter.program", &self.converter.program),
            ("docking.program", &self.docking.program),
        ] {
            if value.trim().is_empty() {
                return Err(DockflowError::Config(format!("{key} must not be empty")));
            }
        }
        Ok(())
    }

    /// Coordinator options derived from the runtime section.
    #[must_use]
    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions::default()
            .with_policy(self.runtime.policy)
            .with_exit_grace(self.runtime.exit_grace())
            .with_shutdown_grace(self.runtime.shutdown_grace())
            .with_log_tail_lines(self.runtime.log_tail_lines)
    }
}

/// Coordinator and runner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Container command line tool.
    #[serde(default = "default_container_cli")]
    pub container_cli: String,
    /// Root under which sandbox mounts are placed.
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
    /// Whether independent stages may overlap.
    #[serde(default)]
    pub policy: ExecutionPolicy,
    /// Watcher poll interval.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: f64,
    /// Grace for detached processes after the job succeeds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: f64,
    /// Grace for artifacts to settle after a successful exit.
    #[serde(default = "default_exit_grace")]
    pub exit_grace_seconds: f64,
    /// Log lines kept in failure records.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_container_cli() -> String {
    "docker".to_string()
}

fn default_mount_root() -> PathBuf {
    PathBuf::from(crate::mounts::DEFAULT_MOUNT_ROOT)
}

fn default_poll_interval() -> f64 {
    0.5
}

fn default_shutdown_grace() -> f64 {
    60.0
}

fn default_exit_grace() -> f64 {
    30.0
}

fn default_log_tail_lines() -> usize {
    20
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            container_cli: default_container_cli(),
            mount_root: default_mount_root(),
            policy: ExecutionPolicy::default(),
            poll_interval_seconds: default_poll_interval(),
            shutdown_grace_seconds: default_shutdown_grace(),
            exit_grace_seconds: default_exit_grace(),
            log_tail_lines: default_log_tail_lines(),
            log_format: LogFormat::default(),
        }
    }
}

impl RuntimeConfig {
    /// Poll interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        seconds(self.poll_interval_seconds)
    }

    /// Shutdown grace as a duration.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        seconds(self.shutdown_grace_seconds)
    }

    /// Exit grace as a duration.
    #[must_use]
    pub fn exit_grace(&self) -> Duration {
        seconds(self.exit_grace_seconds)
    }

    /// Sets the execution policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval_seconds(mut self, value: f64) -> Self {
        self.poll_interval_seconds = value;
        self
    }
}

/// Predictor model preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPreset {
    /// Single chain.
    #[default]
    Monomer,
    /// Single chain, CASP14 configuration.
    MonomerCasp14,
    /// Single chain with pTM head.
    MonomerPtm,
    /// Complexes.
    Multimer,
}

impl fmt::Display for ModelPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Monomer => write!(f, "monomer"),
            Self::MonomerCasp14 => write!(f, "monomer_casp14"),
            Self::MonomerPtm => write!(f, "monomer_ptm"),
            Self::Multimer => write!(f, "multimer"),
        }
    }
}

/// Predictor database preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbPreset {
    /// Full BFD and Uniclust30.
    #[default]
    FullDbs,
    /// Small BFD only.
    ReducedDbs,
}

impl fmt::Display for DbPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullDbs => write!(f, "full_dbs"),
            Self::ReducedDbs => write!(f, "reduced_dbs"),
        }
    }
}

/// Structure predictor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorConfig {
    /// Container image.
    #[serde(default = "default_predictor_image")]
    pub image: String,
    /// Installation (image build) directory, checked against `data_dir`.
    #[serde(default)]
    pub install_dir: Option<PathBuf>,
    /// Reference database directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Model preset.
    #[serde(default)]
    pub model_preset: ModelPreset,
    /// Database preset.
    #[serde(default)]
    pub db_preset: DbPreset,
    /// Latest template release date considered.
    #[serde(default = "default_max_template_date")]
    pub max_template_date: String,
    /// Seeds per model in multimer mode.
    #[serde(default = "default_multimer_predictions")]
    pub num_multimer_predictions_per_model: u32,
    /// Run timing benchmarks.
    #[serde(default)]
    pub benchmark: bool,
    /// Reuse MSAs already present in the output directory.
    #[serde(default)]
    pub use_precomputed_msas: bool,
    /// Relax the predicted structures.
    #[serde(default = "default_true")]
    pub run_relax: bool,
    /// Relax on the accelerator when one is used.
    #[serde(default = "default_true")]
    pub enable_gpu_relax: bool,
    /// Request accelerator access.
    #[serde(default = "default_true")]
    pub use_gpu: bool,
    /// Value of `NVIDIA_VISIBLE_DEVICES`.
    #[serde(default = "default_gpu_devices")]
    pub gpu_devices: String,
    /// Optional `uid[:gid]` for the container.
    ///
    /// Unset by default, so the container runs as its image's user and the
    /// files it writes may not be owned by the invoking account. Set it to
    /// the operator's `uid:gid` to keep the output directory writable.
    #[serde(default)]
    pub user: Option<String>,
    /// File name of the canonical structure inside `{out}/{receptor}/`.
    #[serde(default = "default_structure_filename")]
    pub structure_filename: String,
    /// Wait bound for the structure.
    #[serde(default = "default_predictor_wait")]
    pub max_wait_seconds: f64,
}

fn default_predictor_image() -> String {
    "alphafold".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data/alphafold")
}

fn default_max_template_date() -> String {
    "2020-05-14".to_string()
}

fn default_multimer_predictions() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_gpu_devices() -> String {
    "all".to_string()
}

fn default_structure_filename() -> String {
    "ranked_0.pdb".to_string()
}

fn default_predictor_wait() -> f64 {
    172_800.0
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            image: default_predictor_image(),
            install_dir: None,
            data_dir: default_data_dir(),
            model_preset: ModelPreset::default(),
            db_preset: DbPreset::default(),
            max_template_date: default_max_template_date(),
            num_multimer_predictions_per_model: default_multimer_predictions(),
            benchmark: false,
            use_precomputed_msas: false,
            run_relax: true,
            enable_gpu_relax: true,
            use_gpu: true,
            gpu_devices: default_gpu_devices(),
            user: None,
            structure_filename: default_structure_filename(),
            max_wait_seconds: default_predictor_wait(),
        }
    }
}

impl PredictorConfig {
    /// Wait bound as a duration.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        seconds(self.max_wait_seconds)
    }

    /// Whether relaxation runs on the accelerator.
    #[must_use]
    pub fn use_gpu_relax(&self) -> bool {
        self.enable_gpu_relax && self.use_gpu
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Sets the installation directory.
    #[must_use]
    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = Some(dir.into());
        self
    }

    /// Sets the presets.
    #[must_use]
    pub fn with_presets(mut self, model: ModelPreset, db: DbPreset) -> Self {
        self.model_preset = model;
        self.db_preset = db;
        self
    }
}

/// Ligand converter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Converter executable.
    #[serde(default = "default_converter_program")]
    pub program: String,
    /// Wait bound for the converted ligand.
    #[serde(default = "default_converter_wait")]
    pub max_wait_seconds: f64,
}

fn default_converter_program() -> String {
    "obabel".to_string()
}

fn default_converter_wait() -> f64 {
    600.0
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: default_converter_program(),
            max_wait_seconds: default_converter_wait(),
        }
    }
}

impl ConverterConfig {
    /// Wait bound as a duration.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        seconds(self.max_wait_seconds)
    }
}

/// Docking engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockingConfig {
    /// Docking executable.
    #[serde(default = "default_docking_program")]
    pub program: String,
    /// Search-box configuration file passed with `--config`.
    #[serde(default = "default_docking_config_path")]
    pub config_path: PathBuf,
    /// Wait bound for pose and score log.
    #[serde(default = "default_docking_wait")]
    pub max_wait_seconds: f64,
}

fn default_docking_program() -> String {
    "vina".to_string()
}

fn default_docking_config_path() -> PathBuf {
    PathBuf::from("/tmp/autodock_vina/config.txt")
}

fn default_docking_wait() -> f64 {
    3600.0
}

impl Default for DockingConfig {
    fn default() -> Self {
        Self {
            program: default_docking_program(),
            config_path: default_docking_config_path(),
            max_wait_seconds: default_docking_wait(),
        }
    }
}

impl DockingConfig {
    /// Wait bound as a duration.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        seconds(self.max_wait_seconds)
    }

    /// Sets the search-box configuration file.
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }
}

/// Builds the wait policy for a stage from its bound and the runtime poll.
#[must_use]
pub fn wait_policy(max_wait: Duration, runtime: &RuntimeConfig) -> WaitPolicy {
    WaitPolicy::new(max_wait, runtime.poll_interval())
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
