//! Host-to-sandbox path translation.
//!
//! Stages that run inside a container cannot see host paths. Every host input
//! is bound under a per-job mount root and the stage's arguments reference the
//! in-sandbox path instead.

mod table;
mod translator;

pub use table::MountTable;
pub use translator::{absolutize, normalize, resolve_source, PathTranslator, DEFAULT_MOUNT_ROOT};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Access mode for a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// The sandbox may only read.
    #[default]
    ReadOnly,
    /// The sandbox may write (used for output directories).
    ReadWrite,
}

/// Whether a mount binds a directory or stands in for a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// The host directory itself is bound.
    Directory,
    /// The file's parent directory is bound and the file name re-appended.
    File,
}

/// One host-path → sandbox-path binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountEntry {
    /// Host directory that is bound.
    pub source: PathBuf,
    /// Where it appears inside the sandbox.
    pub target: PathBuf,
    /// Read-only or read-write.
    pub access: AccessMode,
    /// Directory or single-file binding.
    pub entry_type: EntryType,
}

impl MountEntry {
    /// Returns true if the sandbox may write through this mount.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.access == AccessMode::ReadWrite
    }

    /// Renders the entry as a `source:target[:ro]` volume spec.
    #[must_use]
    pub fn volume_spec(&self) -> String {
        let mut spec = format!("{}:{}", self.source.display(), self.target.display());
        if !self.is_writable() {
            spec.push_str(":ro");
        }
        spec
    }
}

impl fmt::Display for MountEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source.display(), self.target.display())
    }
}
