//! Path translator for sandboxed stages.

use super::{AccessMode, EntryType, MountEntry};
use crate::errors::DockflowError;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Default sandbox directory under which all inputs are bound.
pub const DEFAULT_MOUNT_ROOT: &str = "/mnt";

/// Maps host paths into a sandbox namespace rooted at a fixed directory.
///
/// Translation only reads filesystem metadata, so independent inputs can be
/// translated concurrently.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    root: PathBuf,
}

impl Default for PathTranslator {
    fn default() -> Self {
        Self::new(DEFAULT_MOUNT_ROOT)
    }
}

impl PathTranslator {
    /// Creates a translator binding everything under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the sandbox mount root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Produces the mount entry and in-sandbox path for `host_path`.
    ///
    /// A directory is bound at `{root}/{mount_name}`. A file is reached by
    /// binding its parent directory there and re-appending the file name,
    /// so sibling files stay visible to the stage.
    ///
    /// # Errors
    ///
    /// `SourceNotFound` if `host_path` does not exist, and
    /// `UnsafeMountConfiguration` for a mount name that is not a single path
    /// component.
    pub fn translate(
        &self,
        mount_name: &str,
        host_path: &Path,
        access: AccessMode,
    ) -> Result<(MountEntry, PathBuf), DockflowError> {
        validate_mount_name(mount_name)?;
        let path = resolve_source(host_path)?;
        self.bind(mount_name, path, access)
    }

    /// Like [`PathTranslator::translate`], but only the parent directory has
    /// to exist.
    ///
    /// Used for paths that name a file prefix rather than a file (database
    /// stems such as `pdb70/pdb70`).
    ///
    /// # Errors
    ///
    /// `SourceNotFound` if the parent directory does not exist.
    pub fn translate_prefix(
        &self,
        mount_name: &str,
        host_path: &Path,
        access: AccessMode,
    ) -> Result<(MountEntry, PathBuf), DockflowError> {
        validate_mount_name(mount_name)?;
        let path = absolutize(host_path)?;
        if !path.is_dir() {
            let parent = path
                .parent()
                .ok_or_else(|| DockflowError::source_not_found(&path))?;
            resolve_source(parent)?;
        }
        self.bind(mount_name, path, access)
    }

    fn bind(
        &self,
        mount_name: &str,
        path: PathBuf,
        access: AccessMode,
    ) -> Result<(MountEntry, PathBuf), DockflowError> {
        let target = self.root.join(mount_name);

        let (source, entry_type, sandbox_path) = if path.is_dir() {
            (path, EntryType::Directory, target.clone())
        } else {
            let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
                return Err(DockflowError::source_not_found(&path));
            };
            let sandbox_path = target.join(file_name);
            (parent.to_path_buf(), EntryType::File, sandbox_path)
        };

        debug!(
            mount = mount_name,
            source = %source.display(),
            target = %target.display(),
            "Mounting"
        );

        let entry = MountEntry {
            source,
            target,
            access,
            entry_type,
        };
        Ok((entry, sandbox_path))
    }

    /// Rejects a data directory that lives inside the tool's installation.
    ///
    /// Building an image from the installation directory would otherwise copy
    /// the (very large) reference databases into the build context.
    ///
    /// # Errors
    ///
    /// `UnsafeMountConfiguration` if `data_dir` equals or is nested in
    /// `install_dir`.
    pub fn check_layout(install_dir: &Path, data_dir: &Path) -> Result<(), DockflowError> {
        let install = absolutize(install_dir)?;
        let data = absolutize(data_dir)?;

        if data.starts_with(&install) {
            return Err(DockflowError::unsafe_mount(format!(
                "data directory {} must not be inside the installation directory {}",
                data.display(),
                install.display()
            )));
        }
        Ok(())
    }
}

/// Returns the absolute form of `host_path`, failing if it does not exist.
///
/// # Errors
///
/// `SourceNotFound` when the path is missing.
pub fn resolve_source(host_path: &Path) -> Result<PathBuf, DockflowError> {
    let path = absolutize(host_path)?;
    match std::fs::metadata(&path) {
        Ok(_) => Ok(path),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(DockflowError::source_not_found(path)),
        Err(err) => Err(DockflowError::Io(err)),
    }
}

/// Makes `path` absolute and removes `.`/`..` components lexically.
pub fn absolutize(path: &Path) -> Result<PathBuf, DockflowError> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize(&joined))
}

/// Lexically normalizes a path without touching the filesystem.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn validate_mount_name(name: &str) -> Result<(), DockflowError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(DockflowError::unsafe_mount(format!(
            "mount name '{name}' must be a single path component"
        ))),
    }
}
