//! The result manifest handed to report rendering.

use super::{ArtifactKind, DeclaredArtifact, JobId};
use crate::errors::DockflowError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The finished set of artifacts produced by a job.
///
/// Built from the stages' declared outputs, never from scanning the output
/// directory, so a wrong manifest is reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultManifest {
    /// The job these artifacts belong to.
    pub job_id: JobId,
    /// The job's output directory.
    pub output_dir: PathBuf,
    /// Artifact paths by kind.
    pub artifacts: BTreeMap<ArtifactKind, PathBuf>,
}

impl ResultManifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new(job_id: JobId, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            job_id,
            output_dir: output_dir.into(),
            artifacts: BTreeMap::new(),
        }
    }

    /// Adds an artifact.
    #[must_use]
    pub fn with_artifact(mut self, kind: ArtifactKind, path: impl Into<PathBuf>) -> Self {
        self.artifacts.insert(kind, path.into());
        self
    }

    /// Adds every declared artifact.
    pub fn extend<'a>(&mut self, declared: impl IntoIterator<Item = &'a DeclaredArtifact>) {
        for artifact in declared {
            self.artifacts.insert(artifact.kind, artifact.path.clone());
        }
    }

    /// Returns the path for `kind`, if present.
    #[must_use]
    pub fn get(&self, kind: ArtifactKind) -> Option<&Path> {
        self.artifacts.get(&kind).map(PathBuf::as_path)
    }

    /// Returns the required kinds that are absent.
    #[must_use]
    pub fn missing(&self) -> Vec<ArtifactKind> {
        ArtifactKind::ALL
            .into_iter()
            .filter(|kind| !self.artifacts.contains_key(kind))
            .collect()
    }

    /// Checks that every required artifact is referenced.
    pub fn validate(&self) -> Result<(), DockflowError> {
        let missing = self.missing();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DockflowError::ManifestIncomplete { missing })
        }
    }

    /// Returns `kind`'s path relative to the output directory.
    ///
    /// Paths outside the output directory are returned unchanged.
    #[must_use]
    pub fn relative(&self, kind: ArtifactKind) -> Option<PathBuf> {
        self.get(kind).map(|path| {
            path.strip_prefix(&self.output_dir)
                .map_or_else(|_| path.to_path_buf(), Path::to_path_buf)
        })
    }
}
