use std::path::{Path, PathBuf};

use crate::error::Result;

/// A discovered file.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Path relative to the walked root directory.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
}

/// Recursively walk a directory and discover files with one of the given
/// extensions.
///
/// Skips hidden files/directories (names starting with `.`). Results are
/// sorted by relative path. A missing root yields no files.
pub fn discover_files(
    root: &Path,
    extensions: &[&str],
) -> Result<Vec<DiscoveredFile>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let canonical_root = root.canonicalize()?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, extensions, &mut results)?;
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    extensions: &[&str],
    results: &mut Vec<DiscoveredFile>,
) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            walk_dir(root, &path, extensions, results)?;
        } else if file_type.is_symlink() {
            // Skip broken links and links to directories (cycle risk).
            let Ok(resolved) = path.canonicalize() else {
                continue;
            };
            if resolved.is_file() && has_extension(&resolved, extensions) {
                results.push(discovered(root, &path, resolved));
            }
        } else if file_type.is_file() && has_extension(&path, extensions) {
            let absolute = path.canonicalize()?;
            results.push(discovered(root, &path, absolute));
        }
    }

    Ok(())
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.contains(&ext))
}

fn discovered(root: &Path, path: &Path, absolute_path: PathBuf) -> DiscoveredFile {
    DiscoveredFile {
        relative_path: path.strip_prefix(root).unwrap_or(path).to_path_buf(),
        absolute_path,
    }
}
