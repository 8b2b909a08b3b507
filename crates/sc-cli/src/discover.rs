use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Immediate subdirectories of `root` whose name starts with `prefix`, sorted.
pub(crate) fn find_point_dirs(root: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("scan {}", root.display()))?;
        // Symlinks are not followed.
        if !entry.file_type().is_dir() {
            continue;
        }
        if entry.file_name().to_str().is_some_and(|n| n.starts_with(prefix)) {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

/// Every `<root>/<point>/<file_name>`, sorted by point folder.
pub(crate) fn find_point_tables(root: &Path, file_name: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).min_depth(2).max_depth(2).sort_by_file_name() {
        let entry = entry.with_context(|| format!("scan {}", root.display()))?;
        if entry.file_type().is_file() && entry.file_name() == file_name {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}
