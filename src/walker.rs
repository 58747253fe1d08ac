use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use crate::{document::FileType, error::Result};

/// A document file found under a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Path relative to the watched root.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
    pub file_type: FileType,
    /// Last modification time as seconds since the Unix epoch.
    pub mtime: u64,
}

/// Recursively collect files of the given types under `root`.
///
/// Hidden entries (names starting with `.`) are skipped, symlinked
/// directories are not followed, and results are sorted by relative path.
pub fn discover_files(
    root: &Path,
    file_types: &[FileType],
) -> Result<Vec<DiscoveredFile>> {
    let canonical_root = root.canonicalize()?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, file_types, &mut results)?;
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    file_types: &[FileType],
    results: &mut Vec<DiscoveredFile>,
) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        let kind = entry.file_type()?;

        if kind.is_dir() {
            walk_dir(root, &path, file_types, results)?;
            continue;
        }

        let absolute = if kind.is_symlink() {
            match path.canonicalize() {
                Ok(resolved) if resolved.is_file() => resolved,
                // broken links and linked directories
                _ => continue,
            }
        } else if kind.is_file() {
            path.canonicalize()?
        } else {
            continue;
        };

        let Some(file_type) = FileType::from_path(&absolute)
            .or_else(|| FileType::from_path(&path))
            .filter(|t| file_types.contains(t))
        else {
            continue;
        };

        results.push(DiscoveredFile {
            relative_path: path.strip_prefix(root).unwrap_or(&path).to_path_buf(),
            mtime: modified_secs(&absolute)?,
            absolute_path: absolute,
            file_type,
        });
    }
    Ok(())
}

/// Modification time of `path` in whole seconds since the Unix epoch.
pub fn modified_secs(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)?
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs())
}
