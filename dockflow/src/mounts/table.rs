use super::MountEntry;
use crate::errors::DockflowError;
use std::path::Path;

/// The set of bind mounts for one sandboxed stage.
///
/// Targets are unique: inserting an identical entry twice is a no-op, while
/// binding a different source (or access mode) at an existing target is
/// rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry.
    ///
    /// # Errors
    ///
    /// `UnsafeMountConfiguration` if another entry already uses the target.
    pub fn insert(&mut self, entry: MountEntry) -> Result<(), DockflowError> {
        if let Some(existing) = self.get(&entry.target) {
            if *existing == entry {
                return Ok(());
            }
            return Err(DockflowError::unsafe_mount(format!(
                "mount target {} is bound to both {} and {}",
                entry.target.display(),
                existing.source.display(),
                entry.source.display()
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Returns the entry bound at `target`.
    #[must_use]
    pub fn get(&self, target: &Path) -> Option<&MountEntry> {
        self.entries.iter().find(|entry| entry.target == target)
    }

    /// Entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Iterates over the entries.
    pub fn iter(&self) -> impl Iterator<Item = &MountEntry> {
        self.entries.iter()
    }

    /// Number of distinct mounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is mounted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a MountTable {
    type Item = &'a MountEntry;
    type IntoIter = std::slice::Iter<'a, MountEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
