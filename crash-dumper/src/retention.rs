//! Caps the number of dump files kept on disk for each [`DumpKind`].
//!
//! Pruning is best effort: a file that can't be inspected or removed is logged
//! and skipped, it never stops the remaining files from being processed.

use crate::{DumpKind, DumperConfig, naming};
use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

/// A dump file found during a scan, paired with its last modification time
#[derive(Clone, Debug)]
pub struct DumpFileDescriptor {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// The outcome of a call to [`keep_newest`]
#[derive(Default, Debug)]
pub struct RetentionReport {
    /// Files that were within the newest `keep` and left alone
    pub kept: Vec<PathBuf>,
    /// Files that were removed
    pub deleted: Vec<PathBuf>,
    /// Files that should have been removed, but couldn't be
    pub failed: Vec<PathBuf>,
}

/// Lists all of the dumps of the specified kind in `dir`, newest first.
///
/// Directories, and files whose modification time can't be retrieved, are
/// skipped.
pub fn list_dumps(dir: &Path, kind: DumpKind) -> std::io::Result<Vec<DumpFileDescriptor>> {
    let prefix = naming::kind_prefix(kind);
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("failed to read entry in '{}': {err}", dir.display());
                continue;
            }
        };

        if !entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(&prefix))
        {
            continue;
        }

        let path = entry.path();
        let modified = match entry.metadata() {
            Ok(md) if md.is_dir() => continue,
            Ok(md) => md.modified(),
            Err(err) => Err(err),
        };

        match modified {
            Ok(modified) => files.push(DumpFileDescriptor { path, modified }),
            Err(err) => {
                log::warn!(
                    "unable to retrieve modification time of '{}': {err}",
                    path.display()
                );
            }
        }
    }

    files.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(files)
}

/// Deletes every dump of the specified kind in `dir` except the `keep` most
/// recently modified ones
pub fn keep_newest(dir: &Path, kind: DumpKind, keep: usize) -> RetentionReport {
    let mut report = RetentionReport::default();

    let files = match list_dumps(dir, kind) {
        Ok(files) => files,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::error!("unable to find {kind} dumps in '{}': {err}", dir.display());
            }

            return report;
        }
    };

    let mut files = files.into_iter();
    report
        .kept
        .extend(files.by_ref().take(keep).map(|fd| fd.path));

    for fd in files {
        match std::fs::remove_file(&fd.path) {
            Ok(()) => {
                log::info!("deleted old dump file '{}'", fd.path.display());
                report.deleted.push(fd.path);
            }
            Err(err) => {
                log::error!("failed to delete file '{}': {err}", fd.path.display());
                report.failed.push(fd.path);
            }
        }
    }

    report
}

/// Applies the retention policy from `config` to every kind, returning the
/// report for each
pub fn apply_policy(dir: &Path, config: &DumperConfig) -> [(DumpKind, RetentionReport); 2] {
    [DumpKind::Full, DumpKind::Minimal]
        .map(|kind| (kind, keep_newest(dir, kind, config.keep_count(kind))))
}
