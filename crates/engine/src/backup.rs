//! Backup module for protecting existing destinations.
//!
//! Before a job is scheduled, a file already sitting at its destination is
//! moved aside so the encoder cannot destroy it. If the job fails, the runner
//! moves it back. This module holds the naming scheme, the pre-flight step and
//! the restore step.

use crate::job::Job;
use fconv_config::ConflictPolicy;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while moving files aside or back.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The destination exists and the policy forbids touching it.
    #[error("Destination already exists: {0:?}")]
    DestinationExists(PathBuf),

    /// Failed to move the existing destination aside.
    #[error("Failed to back up {from:?} to {to:?}: {source}")]
    BackupFailed {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    /// Failed to move a backup over the destination.
    #[error("Failed to restore {from:?} to {to:?}: {source}")]
    RestoreFailed {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    /// Failed to delete a file that is being overwritten.
    #[error("Failed to remove {path:?}: {source}")]
    RemoveFailed { path: PathBuf, source: io::Error },
}

/// Which naming family a backup belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    /// A different file used to live at the destination.
    Backup,
    /// The source itself is being re-encoded onto its own path.
    Old,
}

impl BackupKind {
    fn label(self) -> &'static str {
        match self {
            BackupKind::Backup => "backup",
            BackupKind::Old => "old",
        }
    }
}

/// Candidate backup name for attempt `n` (1-based).
///
/// The first attempt has no number: `clip.backup.mp4`, then
/// `clip.backup2.mp4`, `clip.backup3.mp4`, ...
fn backup_candidate(destination: &Path, kind: BackupKind, n: u32) -> PathBuf {
    let mut name: OsString = destination
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(kind.label());
    if n > 1 {
        name.push(n.to_string());
    }
    if let Some(ext) = destination.extension() {
        name.push(".");
        name.push(ext);
    }

    destination.with_file_name(name)
}

/// Generates the first unused backup path for a destination.
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use fconv::backup::{backup_path, BackupKind};
///
/// let backup = backup_path(Path::new("/nonexistent/clip.mp4"), BackupKind::Backup);
/// assert_eq!(backup, Path::new("/nonexistent/clip.backup.mp4"));
/// ```
pub fn backup_path(destination: &Path, kind: BackupKind) -> PathBuf {
    (1..)
        .map(|n| backup_candidate(destination, kind, n))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| backup_candidate(destination, kind, 1))
}

/// Moves a file, falling back to copy and delete when a rename is not
/// possible (for example across filesystems).
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

/// Moves an existing destination aside according to `policy`.
///
/// Returns the job to schedule, which may differ from the input:
/// - a recorded `backup_path` when the old file was kept,
/// - a redirected `source` when the job re-encodes a file onto itself,
/// - `delete_source_on_success` when an in-place overwrite should drop the
///   moved original once the new file is written.
///
/// Jobs whose destination does not exist are returned unchanged.
pub fn prepare_destination(job: Job, policy: ConflictPolicy) -> Result<Job, BackupError> {
    if !job.destination.exists() {
        return Ok(job);
    }

    let in_place = job.source == job.destination;

    match policy {
        ConflictPolicy::Exit => Err(BackupError::DestinationExists(job.destination)),
        ConflictPolicy::Overwrite if !in_place => {
            fs::remove_file(&job.destination).map_err(|source| BackupError::RemoveFailed {
                path: job.destination.clone(),
                source,
            })?;
            tracing::info!(destination = %job.destination.display(), "removed existing destination");
            Ok(job)
        }
        ConflictPolicy::Overwrite => {
            let moved = move_aside(&job.destination, BackupKind::Old)?;
            Ok(Job {
                source: moved.clone(),
                ..job
            }
            .with_backup(moved)
            .with_delete_source(true))
        }
        ConflictPolicy::Backup => {
            let kind = if in_place {
                BackupKind::Old
            } else {
                BackupKind::Backup
            };
            let moved = move_aside(&job.destination, kind)?;
            let source = if in_place {
                moved.clone()
            } else {
                job.source.clone()
            };
            Ok(Job { source, ..job }.with_backup(moved))
        }
    }
}

fn move_aside(destination: &Path, kind: BackupKind) -> Result<PathBuf, BackupError> {
    let backup = backup_path(destination, kind);
    move_file(destination, &backup).map_err(|source| BackupError::BackupFailed {
        from: destination.to_path_buf(),
        to: backup.clone(),
        source,
    })?;
    tracing::info!(
        destination = %destination.display(),
        backup = %backup.display(),
        "moved existing destination aside"
    );
    Ok(backup)
}

/// Moves a backup back over the destination, replacing any partial output.
pub fn restore_backup(backup: &Path, destination: &Path) -> Result<(), BackupError> {
    move_file(backup, destination).map_err(|source| BackupError::RestoreFailed {
        from: backup.to_path_buf(),
        to: destination.to_path_buf(),
        source,
    })?;
    tracing::info!(
        destination = %destination.display(),
        backup = %backup.display(),
        "restored backup"
    );
    Ok(())
}
