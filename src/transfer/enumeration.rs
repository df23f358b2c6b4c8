use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::aggregator::{ErrorAggregator, key_for};
use crate::error::{ErrorKind, ReplicationError};
use crate::transfer::helpers::display_path;

/// A regular file found under the source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SourceFile {
    pub(crate) path: PathBuf,
    /// Path relative to the source directory; a bare file name unless recursive
    pub(crate) rel: PathBuf,
    pub(crate) size: u64,
}

fn open_dir_error(dir: &Path, e: std::io::Error) -> ReplicationError {
    ReplicationError::io(
        ErrorKind::Open,
        format!("failed to read source dir {}", display_path(dir)),
        e,
    )
    .fatal()
}

/// Immediate regular files of `dir`, sorted by name. Subdirectories are skipped.
///
/// An unreadable directory is returned as an error; unreadable entries are
/// reported under the directory key and skipped.
pub(crate) fn enumerate_flat(
    dir: &Path,
    aggregator: &ErrorAggregator,
) -> Result<Vec<SourceFile>, ReplicationError> {
    let rd = std::fs::read_dir(dir).map_err(|e| open_dir_error(dir, e))?;
    let dir_key = key_for(dir);
    let mut files = Vec::new();
    for ent in rd {
        let ent = match ent {
            Ok(ent) => ent,
            Err(e) => {
                aggregator.report(
                    &dir_key,
                    ErrorKind::Open,
                    format!("failed to read an entry of {}", display_path(dir)),
                    Some(e.to_string()),
                );
                continue;
            }
        };
        let path = ent.path();
        // follow symlinks so a link to a file is replicated as a file
        let md = match std::fs::metadata(&path) {
            Ok(md) => md,
            Err(e) => {
                aggregator.report(
                    &dir_key,
                    ErrorKind::Open,
                    format!("failed to stat {}", display_path(&path)),
                    Some(e.to_string()),
                );
                continue;
            }
        };
        if !md.is_file() {
            tracing::debug!("[enumerate] skipping non-file {}", display_path(&path));
            continue;
        }
        files.push(SourceFile { rel: PathBuf::from(ent.file_name()), path, size: md.len() });
    }
    files.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(files)
}

/// Every regular file below `dir`, depth first in name order.
pub(crate) fn enumerate_recursive(
    dir: &Path,
    aggregator: &ErrorAggregator,
) -> Result<Vec<SourceFile>, ReplicationError> {
    // surface an unreadable root the same way as the flat walk
    std::fs::read_dir(dir).map_err(|e| open_dir_error(dir, e))?;
    let dir_key = key_for(dir);
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let at = e.path().map(|p| display_path(p).to_string()).unwrap_or_default();
                aggregator.report(
                    &dir_key,
                    ErrorKind::Open,
                    format!("failed to walk {}", at),
                    Some(e.to_string()),
                );
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let size = match entry.metadata() {
            Ok(md) => md.len(),
            Err(e) => {
                aggregator.report(
                    &dir_key,
                    ErrorKind::Open,
                    format!("failed to stat {}", display_path(entry.path())),
                    Some(e.to_string()),
                );
                continue;
            }
        };
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path()).to_path_buf();
        files.push(SourceFile { path: entry.path().to_path_buf(), rel, size });
    }
    Ok(files)
}
