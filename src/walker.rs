use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use crate::{error::Result, extract::DocumentFormat};

/// A discovered document file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Path relative to the indexed folder.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
    /// File size in bytes.
    pub size: u64,
    /// Last modification time as nanoseconds since the Unix epoch.
    pub mtime: u64,
}

impl DiscoveredFile {
    /// Stable manifest key: the relative path with `/` separators.
    pub fn key(&self) -> String {
        path_key(&self.relative_path)
    }

    pub fn file_name(&self) -> String {
        self.relative_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Convert a relative path into the `/`-separated form used as a key.
pub fn path_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk a directory and discover files in a supported document format.
///
/// Skips hidden files/directories (names starting with `.`). Descends into
/// subdirectories only when `recursive` is set. Results are sorted by
/// relative path.
pub fn discover_files(
    root: &Path,
    recursive: bool,
) -> Result<Vec<DiscoveredFile>> {
    let canonical_root = root.canonicalize()?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, recursive, &mut results)?;
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    recursive: bool,
    results: &mut Vec<DiscoveredFile>,
) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if recursive {
                walk_dir(root, &entry.path(), recursive, results)?;
            }
        } else if file_type.is_symlink() {
            let Ok(resolved) = entry.path().canonicalize() else {
                continue;
            };
            // Directory links are never followed; that also rules out cycles.
            if resolved.is_file() && is_supported(&resolved) {
                results.push(make_discovered(root, &entry.path(), &resolved)?);
            }
        } else if file_type.is_file() && is_supported(&entry.path()) {
            let abs = entry.path().canonicalize()?;
            results.push(make_discovered(root, &entry.path(), &abs)?);
        }
    }

    Ok(())
}

fn is_supported(path: &Path) -> bool {
    DocumentFormat::from_path(path).is_some()
}

fn make_discovered(
    root: &Path,
    original_path: &Path,
    absolute_path: &Path,
) -> Result<DiscoveredFile> {
    let relative_path = original_path
        .strip_prefix(root)
        .unwrap_or(original_path)
        .to_path_buf();

    let metadata = std::fs::metadata(absolute_path)?;
    let mtime = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mtime = u64::try_from(mtime).unwrap_or(u64::MAX);

    Ok(DiscoveredFile {
        relative_path,
        absolute_path: absolute_path.to_path_buf(),
        size: metadata.len(),
        mtime,
    })
}
