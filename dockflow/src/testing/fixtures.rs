//! Scratch inputs for end-to-end docking jobs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use crate::config::{Config, DockingConfig, PredictorConfig};
use crate::docking::{stages, DockingLayout, DockingPipeline, DockingRequest};
use crate::testing::{ScriptedRunner, StageScript};

/// Structure written by the scripted predictor. The final `END` record is
/// what receptor preparation strips.
pub const STRUCTURE: &str = "ATOM      1  N   MET A   1      27.340  24.430   2.614  1.00  0.00           N\nTER\nEND\n";

/// Database directories the predictor mounts for the default presets.
const DATABASE_DIRS: [&str; 6] = [
    "uniref90",
    "mgnify",
    "pdb_mmcif/mmcif_files",
    "pdb70",
    "uniclust30/uniclust30_2018_08",
    "bfd",
];

/// A temporary input tree for the `Y265H` / `1` / `mol2` scenario.
pub struct DockingFixture {
    root: TempDir,
    /// Predictor data directory.
    pub data_dir: PathBuf,
    /// Receptor sequence file.
    pub receptor: PathBuf,
    /// Ligand path without extension.
    pub ligand: PathBuf,
    /// Docking engine search-box config.
    pub vina_config: PathBuf,
    /// Job output directory (not created).
    pub output_dir: PathBuf,
}

impl DockingFixture {
    /// Creates the input tree.
    pub fn new() -> std::io::Result<Self> {
        let root = TempDir::new()?;
        let data_dir = root.path().join("af2-data");
        for db in DATABASE_DIRS {
            std::fs::create_dir_all(data_dir.join(db))?;
        }
        let inputs = root.path().join("inputs");
        std::fs::create_dir_all(&inputs)?;

        let receptor = inputs.join("Y265H.fasta");
        std::fs::write(&receptor, ">Y265H\nMKTAYIAKQRQISFVKSHFSRQ\n")?;
        let ligand = inputs.join("1");
        std::fs::write(inputs.join("1.mol2"), "@<TRIPOS>MOLECULE\n1\n")?;
        let vina_config = inputs.join("config.txt");
        std::fs::write(&vina_config, "center_x = 0\ncenter_y = 0\ncenter_z = 0\n")?;

        let output_dir = root.path().join("job1");
        Ok(Self {
            root,
            data_dir,
            receptor,
            ligand,
            vina_config,
            output_dir,
        })
    }

    /// Root of the scratch tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Configuration pointing at the fixture's inputs, with short waits.
    #[must_use]
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.predictor = PredictorConfig::default().with_data_dir(&self.data_dir);
        config.predictor.max_wait_seconds = 600.0;
        config.converter.max_wait_seconds = 60.0;
        config.docking = DockingConfig::default().with_config_path(&self.vina_config);
        config.docking.max_wait_seconds = 120.0;
        config.runtime.exit_grace_seconds = 5.0;
        config.runtime.shutdown_grace_seconds = 5.0;
        config
    }

    /// Pipeline over [`Self::config`].
    #[must_use]
    pub fn pipeline(&self) -> DockingPipeline {
        DockingPipeline::new(self.config())
    }

    /// The scenario request.
    #[must_use]
    pub fn request(&self) -> DockingRequest {
        DockingRequest::new(&self.receptor, &self.ligand, "mol2", &self.output_dir)
    }

    /// Artifact paths of the scenario.
    #[must_use]
    pub fn layout(&self) -> DockingLayout {
        DockingLayout::new(&self.output_dir, "Y265H", "1", "ranked_0.pdb")
    }

    /// A runner whose stages write their artifacts and exit successfully.
    #[must_use]
    pub fn succeeding_runner(&self) -> ScriptedRunner {
        let layout = self.layout();
        ScriptedRunner::new()
            .with_script(stages::PREDICT, predict_script(&layout))
            .with_script(
                stages::CONVERT,
                StageScript::new()
                    .sleep(Duration::from_secs(1))
                    .write(&layout.ligand_pdbqt, "REMARK ligand\n")
                    .exit(0),
            )
            .with_script(stages::DOCK, dock_script(&layout, 0))
    }
}

/// Predictor that writes the structure after 3 s and exits 1 s later.
#[must_use]
pub fn predict_script(layout: &DockingLayout) -> StageScript {
    StageScript::new()
        .log("Predicting structure")
        .sleep(Duration::from_secs(3))
        .write(&layout.structure, STRUCTURE)
        .sleep(Duration::from_secs(1))
        .exit(0)
}

/// Docking engine writing pose and log, then exiting with `code`.
#[must_use]
pub fn dock_script(layout: &DockingLayout, code: i32) -> StageScript {
    StageScript::new()
        .log("Docking")
        .sleep(Duration::from_secs(2))
        .write(&layout.pose, "MODEL 1\nENDMDL\n")
        .write(&layout.score_log, "mode | affinity\n1 -7.2\n")
        .exit(code)
}
