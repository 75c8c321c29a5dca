//! The standard prediction, conversion and docking pipeline.
//!
//! [`DockingPipeline`] turns a [`DockingRequest`] into a [`JobPlan`] with four
//! stages:
//!
//! ```text
//! predict ──▶ prepare ──┐
//!                       ├──▶ dock
//! convert ──────────────┘
//! ```
//!
//! `predict` runs the structure predictor in a container, `convert` and `dock`
//! run host executables, and `prepare` is an in-process transform of the
//! predicted structure into the receptor file the docking engine reads.

use crate::config::{wait_policy, Config, DbPreset, ModelPreset, PredictorConfig};
use crate::core::{ArtifactKind, JobId, StageKind};
use crate::errors::DockflowError;
use crate::events::EventSink;
use crate::mounts::{absolutize, PathTranslator};
use crate::pipeline::{
    Arg, BuiltinTransform, CommandSpec, CompletionSignal, Coordinator, JobPlan, PipelineBuilder,
    StageAction, StageSpec,
};
use crate::report::ReportSpec;
use crate::runner::{ProcessRunner, StageRunner};
use crate::watcher::WaitPolicy;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Stage names used by the pipeline.
pub mod stages {
    /// Structure prediction.
    pub const PREDICT: &str = "predict";
    /// Ligand conversion.
    pub const CONVERT: &str = "convert";
    /// Receptor preparation.
    pub const PREPARE: &str = "prepare";
    /// Docking.
    pub const DOCK: &str = "dock";
}

const PREPARE_MAX_WAIT: Duration = Duration::from_secs(60);

/// A docking job submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockingRequest {
    /// Receptor sequence file; its stem names the receptor.
    pub receptor: PathBuf,
    /// Ligand file, with or without the format extension.
    pub ligand: PathBuf,
    /// Ligand input format, e.g. `mol2`.
    pub ligand_format: String,
    /// Directory owned by the job.
    pub output_dir: PathBuf,
    /// Explicit job id; derived from the request when unset.
    pub job_id: Option<JobId>,
}

impl DockingRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(
        receptor: impl Into<PathBuf>,
        ligand: impl Into<PathBuf>,
        ligand_format: impl Into<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            receptor: receptor.into(),
            ligand: ligand.into(),
            ligand_format: ligand_format.into(),
            output_dir: output_dir.into(),
            job_id: None,
        }
    }

    /// Sets an explicit job id.
    #[must_use]
    pub fn with_job_id(mut self, id: JobId) -> Self {
        self.job_id = Some(id);
        self
    }

    /// Receptor name (sequence file stem).
    pub fn receptor_name(&self) -> Result<String, DockflowError> {
        file_stem(&self.receptor)
    }

    /// Ligand name (file name without the format extension).
    pub fn ligand_name(&self) -> Result<String, DockflowError> {
        file_stem(&self.ligand_stem())
    }

    /// Ligand file as read by the converter: `{ligand}.{format}`.
    #[must_use]
    pub fn ligand_file(&self) -> PathBuf {
        let stem = self.ligand_stem();
        let mut name = stem.into_os_string();
        name.push(".");
        name.push(&self.ligand_format);
        PathBuf::from(name)
    }

    fn ligand_stem(&self) -> PathBuf {
        match self.ligand.extension() {
            Some(ext) if ext.eq_ignore_ascii_case(self.ligand_format.as_str()) => {
                self.ligand.with_extension("")
            }
            _ => self.ligand.clone(),
        }
    }

    fn validate(&self) -> Result<(), DockflowError> {
        let format = &self.ligand_format;
        if format.is_empty() || !format.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DockflowError::Config(format!(
                "ligand format '{format}' is not a file extension"
            )));
        }
        Ok(())
    }
}

/// Paths of one job's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockingLayout {
    /// Output directory.
    pub output_dir: PathBuf,
    /// Predicted structure.
    pub structure: PathBuf,
    /// Prepared receptor.
    pub receptor_pdbqt: PathBuf,
    /// Converted ligand.
    pub ligand_pdbqt: PathBuf,
    /// Docked pose.
    pub pose: PathBuf,
    /// Docking score log.
    pub score_log: PathBuf,
    /// HTML report.
    pub report: PathBuf,
}

impl DockingLayout {
    /// Computes the layout under `output_dir`.
    #[must_use]
    pub fn new(output_dir: &Path, receptor: &str, ligand: &str, structure_filename: &str) -> Self {
        let pair = format!("{receptor}_{ligand}");
        Self {
            output_dir: output_dir.to_path_buf(),
            structure: output_dir.join(receptor).join(structure_filename),
            receptor_pdbqt: output_dir.join(format!("{receptor}.pdbqt")),
            ligand_pdbqt: output_dir.join(format!("{ligand}.pdbqt")),
            pose: output_dir.join(format!("{pair}.pdbqt")),
            score_log: output_dir.join(format!("{pair}.txt")),
            report: output_dir.join(format!("{pair}.html")),
        }
    }
}

/// Builds docking job plans from configuration.
#[derive(Debug, Clone, Default)]
pub struct DockingPipeline {
    config: Config,
}

impl DockingPipeline {
    /// Creates a pipeline from configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A coordinator launching real processes and containers.
    #[must_use]
    pub fn coordinator(&self) -> Coordinator {
        let runner = ProcessRunner::new().with_container_cli(&self.config.runtime.container_cli);
        self.coordinator_with(Arc::new(runner))
    }

    /// A coordinator over a custom runner.
    #[must_use]
    pub fn coordinator_with(&self, runner: Arc<dyn StageRunner>) -> Coordinator {
        Coordinator::new(runner)
            .with_translator(PathTranslator::new(&self.config.runtime.mount_root))
            .with_options(self.config.coordinator_options())
    }

    /// A coordinator over a custom runner reporting to `events`.
    #[must_use]
    pub fn coordinator_with_events(
        &self,
        runner: Arc<dyn StageRunner>,
        events: Arc<dyn EventSink>,
    ) -> Coordinator {
        self.coordinator_with(runner).with_event_sink(events)
    }

    /// Builds the job plan for a request.
    ///
    /// Nothing is checked on disk here; the coordinator does that before
    /// launching anything.
    pub fn plan(&self, request: &DockingRequest) -> Result<JobPlan, DockflowError> {
        request.validate()?;
        let receptor = request.receptor_name()?;
        let ligand = request.ligand_name()?;
        let output_dir = absolutize(&request.output_dir)?;
        let receptor_file = absolutize(&request.receptor)?;
        let ligand_file = absolutize(&request.ligand_file())?;
        let predictor = &self.config.predictor;
        let layout = DockingLayout::new(&output_dir, &receptor, &ligand, &predictor.structure_filename);

        let job_id = request.job_id.clone().unwrap_or_else(|| {
            let out_key = output_dir.to_string_lossy();
            JobId::fingerprint(&[
                receptor.as_str(),
                ligand.as_str(),
                request.ligand_format.as_str(),
                out_key.as_ref(),
            ])
        });
        debug!(job_id = %job_id, receptor, ligand, "Planning docking job");

        let pipeline = PipelineBuilder::new("docking")
            .stage(self.predict_stage(&receptor_file, &layout))?
            .stage(self.convert_stage(&ligand_file, &request.ligand_format, &layout))?
            .stage(self.prepare_stage(&layout))?
            .stage(self.dock_stage(&layout))?;

        let report = ReportSpec::new(&layout.report)
            .with_input("Receptor", display_name(&receptor_file))
            .with_input("Ligand", display_name(&ligand_file))
            .with_input("Ligand format", &request.ligand_format);

        let mut plan = JobPlan::new(job_id, &output_dir, pipeline, report)
            .with_protected_dir(&predictor.data_dir);
        if let Some(install_dir) = &predictor.install_dir {
            plan = plan
                .with_protected_dir(install_dir)
                .with_mount_layout(install_dir, &predictor.data_dir);
        }
        Ok(plan)
    }

    fn wait(&self, max_wait: Duration) -> WaitPolicy {
        wait_policy(max_wait, &self.config.runtime)
    }

    fn predict_stage(&self, fasta: &Path, layout: &DockingLayout) -> StageSpec {
        let predictor = &self.config.predictor;
        let command = predictor_command(predictor, fasta, &layout.output_dir);

        StageSpec::new(stages::PREDICT, StageKind::Predict, StageAction::External(command))
            .with_input(fasta)
            .with_input(&predictor.data_dir)
            .with_output(ArtifactKind::Structure, &layout.structure)
            .with_wait(self.wait(predictor.max_wait()))
            .with_completion(CompletionSignal::Artifact)
    }

    fn convert_stage(&self, ligand_file: &Path, format: &str, layout: &DockingLayout) -> StageSpec {
        let converter = &self.config.converter;
        let command = CommandSpec::new(&converter.program)
            .literal("-i")
            .literal(format)
            .arg(Arg::path("ligand", ligand_file))
            .literal("-opdbqt")
            .literal("-O")
            .arg(Arg::path("ligand_pdbqt", &layout.ligand_pdbqt).writable());

        StageSpec::new(stages::CONVERT, StageKind::Convert, StageAction::External(command))
            .with_input(ligand_file)
            .with_output(ArtifactKind::LigandPdbqt, &layout.ligand_pdbqt)
            .with_wait(self.wait(converter.max_wait()))
    }

    fn prepare_stage(&self, layout: &DockingLayout) -> StageSpec {
        let transform = BuiltinTransform::StripTrailingLine {
            input: layout.structure.clone(),
            output: layout.receptor_pdbqt.clone(),
        };

        StageSpec::new(stages::PREPARE, StageKind::Prepare, StageAction::Builtin(transform))
            .with_dependency(stages::PREDICT)
            .with_output(ArtifactKind::ReceptorPdbqt, &layout.receptor_pdbqt)
            .with_wait(self.wait(PREPARE_MAX_WAIT))
    }

    fn dock_stage(&self, layout: &DockingLayout) -> StageSpec {
        let docking = &self.config.docking;
        let command = CommandSpec::new(&docking.program)
            .literal("--config")
            .arg(Arg::path("config", &docking.config_path))
            .literal("--receptor")
            .arg(Arg::path("receptor", &layout.receptor_pdbqt))
            .literal("--ligand")
            .arg(Arg::path("ligand", &layout.ligand_pdbqt))
            .literal("--out")
            .arg(Arg::path("out", &layout.pose).writable())
            .literal("--log")
            .arg(Arg::path("log", &layout.score_log).writable());

        StageSpec::new(stages::DOCK, StageKind::Dock, StageAction::External(command))
            .with_dependencies([stages::PREPARE, stages::CONVERT])
            .with_input(&docking.config_path)
            .with_output(ArtifactKind::DockingPose, &layout.pose)
            .with_output(ArtifactKind::ScoreLog, &layout.score_log)
            .with_wait(self.wait(docking.max_wait()))
    }
}

/// Reference databases passed to the predictor, as `(flag, path)`.
#[must_use]
pub fn database_paths(predictor: &PredictorConfig) -> Vec<(&'static str, PathBuf)> {
    let data = &predictor.data_dir;
    let mut paths = vec![
        ("uniref90_database_path", data.join("uniref90").join("uniref90.fasta")),
        ("mgnify_database_path", data.join("mgnify").join("mgy_clusters_2018_12.fa")),
        ("data_dir", data.clone()),
        ("template_mmcif_dir", data.join("pdb_mmcif").join("mmcif_files")),
        ("obsolete_pdbs_path", data.join("pdb_mmcif").join("obsolete.dat")),
    ];

    if predictor.model_preset == ModelPreset::Multimer {
        paths.push(("uniprot_database_path", data.join("uniprot").join("uniprot.fasta")));
        paths.push(("pdb_seqres_database_path", data.join("pdb_seqres").join("pdb_seqres.txt")));
    } else {
        paths.push(("pdb70_database_path", data.join("pdb70").join("pdb70")));
    }

    match predictor.db_preset {
        DbPreset::ReducedDbs => paths.push((
            "small_bfd_database_path",
            data.join("small_bfd").join("bfd-first_non_consensus_sequences.fasta"),
        )),
        DbPreset::FullDbs => {
            paths.push((
                "uniclust30_database_path",
                data.join("uniclust30").join("uniclust30_2018_08").join("uniclust30_2018_08"),
            ));
            paths.push((
                "bfd_database_path",
                data.join("bfd").join("bfd_metaclust_clu_complete_id30_c90_final_seq.sorted_opt"),
            ));
        }
    }
    paths
}

/// The predictor command: image entrypoint plus flags.
fn predictor_command(predictor: &PredictorConfig, fasta: &Path, output_dir: &Path) -> CommandSpec {
    let mut command = CommandSpec::new("")
        .in_container(&predictor.image, predictor.user.clone())
        .with_gpu(predictor.use_gpu)
        .arg(Arg::flag_path("--fasta_paths=", "fasta_path_0", fasta));

    for (name, path) in database_paths(predictor) {
        command = command.arg(Arg::flag_path(format!("--{name}="), name, path).prefix_only());
    }

    command
        .arg(Arg::flag_path("--output_dir=", "output", output_dir).writable())
        .literal(format!("--max_template_date={}", predictor.max_template_date))
        .literal(format!("--db_preset={}", predictor.db_preset))
        .literal(format!("--model_preset={}", predictor.model_preset))
        .literal(format!("--benchmark={}", predictor.benchmark))
        .literal(format!("--use_precomputed_msas={}", predictor.use_precomputed_msas))
        .literal(format!(
            "--num_multimer_predictions_per_model={}",
            predictor.num_multimer_predictions_per_model
        ))
        .literal(format!("--run_relax={}", predictor.run_relax))
        .literal(format!("--use_gpu_relax={}", predictor.use_gpu_relax()))
        .literal("--logtostderr")
        .with_env("NVIDIA_VISIBLE_DEVICES", &predictor.gpu_devices)
        .with_env("TF_FORCE_UNIFIED_MEMORY", "1")
        .with_env("XLA_PYTHON_CLIENT_MEM_FRACTION", "4.0")
}

fn file_stem(path: &Path) -> Result<String, DockflowError> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| DockflowError::Config(format!("{} does not name a file", path.display())))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned())
}
