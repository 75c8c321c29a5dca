//! Declared stage artifacts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// The role an artifact plays in the result manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Predicted protein tertiary structure (PDB).
    Structure,
    /// Predicted structure prepared for docking (PDBQT).
    ReceptorPdbqt,
    /// Converted ligand (PDBQT).
    LigandPdbqt,
    /// Docked poses (PDBQT).
    DockingPose,
    /// Docking score log.
    ScoreLog,
}

impl ArtifactKind {
    /// All kinds, in report order.
    pub const ALL: [Self; 5] = [
        Self::Structure,
        Self::ReceptorPdbqt,
        Self::LigandPdbqt,
        Self::DockingPose,
        Self::ScoreLog,
    ];

    /// Human-readable title used in reports.
    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            Self::Structure => "Protein tertiary structure file",
            Self::ReceptorPdbqt => "Protein tertiary structure PDBQT format file",
            Self::LigandPdbqt => "Compound PDBQT format file",
            Self::DockingPose => "Autodock Vina molecular docking result",
            Self::ScoreLog => "Autodock Vina molecular docking scoring value",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structure => write!(f, "structure"),
            Self::ReceptorPdbqt => write!(f, "receptor_pdbqt"),
            Self::LigandPdbqt => write!(f, "ligand_pdbqt"),
            Self::DockingPose => write!(f, "docking_pose"),
            Self::ScoreLog => write!(f, "score_log"),
        }
    }
}

/// An output a stage promises to write.
///
/// The path is fixed before the stage starts so completion can be detected
/// without asking the stage process where it wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredArtifact {
    /// What the artifact is.
    pub kind: ArtifactKind,
    /// Absolute host path.
    pub path: PathBuf,
}

impl DeclaredArtifact {
    /// Creates a new declared artifact.
    #[must_use]
    pub fn new(kind: ArtifactKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    /// Returns the path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
