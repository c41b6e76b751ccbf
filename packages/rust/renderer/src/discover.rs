//! Snapshot discovery: find every archived HTML file under the input directory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use site2docs_shared::{Result, Site2DocsError, Snapshot};

/// Recursively collect `*.html` / `*.htm` files (case-insensitive), sorted by path.
///
/// Errors with [`Site2DocsError::Input`] when `input_dir` is missing or not a directory.
#[instrument(skip_all, fields(input = %input_dir.display()))]
pub fn discover_snapshots(input_dir: &Path) -> Result<Vec<Snapshot>> {
    if !input_dir.exists() {
        return Err(Site2DocsError::input(format!(
            "input directory not found: {}",
            input_dir.display()
        )));
    }
    if !input_dir.is_dir() {
        return Err(Site2DocsError::input(format!(
            "input path is not a directory: {}",
            input_dir.display()
        )));
    }

    let mut files: Vec<PathBuf> = Vec::new();
    let mut pending = vec![input_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            if dir == input_dir {
                Site2DocsError::input(format!("cannot read {}: {e}", dir.display()))
            } else {
                Site2DocsError::io(&dir, e)
            }
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| Site2DocsError::io(&dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| Site2DocsError::io(&path, e))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if is_html_file(&path) {
                files.push(path);
            }
        }
    }
    files.sort();

    let snapshots: Vec<Snapshot> = files
        .into_iter()
        .map(|path| {
            let modified = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from);
            Snapshot::new(input_dir, path, modified)
        })
        .collect();

    debug!(count = snapshots.len(), "discovered snapshots");
    Ok(snapshots)
}

fn is_html_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"))
        .unwrap_or(false)
}
