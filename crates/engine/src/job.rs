//! Job model for fconv.
//!
//! A [`Job`] is an immutable description of one conversion: where the input
//! comes from, where the output goes, which presets shape the encoder
//! arguments, and what happens to the files once the encoder succeeds.

use crate::presets::PresetResolver;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors detected before any job is started.
#[derive(Debug, Error)]
pub enum JobError {
    /// Two jobs would write the same file.
    #[error("Duplicate destination: {0:?} is targeted by more than one job")]
    DuplicateDestination(PathBuf),

    /// The source file does not exist.
    #[error("Source file not found: {0:?}")]
    MissingSource(PathBuf),

    /// A job carries no presets.
    #[error("No presets given for {0:?}")]
    EmptyPresets(PathBuf),

    /// A job would overwrite the input of another job.
    #[error("Destination {0:?} is the source of another job")]
    DestinationIsSource(PathBuf),

    /// A preset token is not known to the catalog.
    #[error("Unknown preset '{token}' for {source_path:?}")]
    UnknownPreset { token: String, source_path: PathBuf },
}

/// One source to destination conversion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Path to the input file.
    pub source: PathBuf,
    /// Path the encoder writes to.
    pub destination: PathBuf,
    /// Preset tokens, applied in order.
    pub presets: Vec<String>,
    /// Where a pre-existing destination was moved before the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    /// Remove the source once the encoder succeeds.
    #[serde(default)]
    pub delete_source_on_success: bool,
    /// Copy the source modification time onto the destination on success.
    #[serde(default)]
    pub copy_timestamps_on_success: bool,
}

impl Job {
    /// Create a job with no backup and no post-completion actions.
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        presets: Vec<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            presets,
            backup_path: None,
            delete_source_on_success: false,
            copy_timestamps_on_success: false,
        }
    }

    /// Record where the previous destination was moved to.
    pub fn with_backup(mut self, backup_path: impl Into<PathBuf>) -> Self {
        self.backup_path = Some(backup_path.into());
        self
    }

    pub fn with_delete_source(mut self, delete: bool) -> Self {
        self.delete_source_on_success = delete;
        self
    }

    pub fn with_copy_timestamps(mut self, copy: bool) -> Self {
        self.copy_timestamps_on_success = copy;
        self
    }

    /// File name of the destination, for display.
    pub fn display_name(&self) -> String {
        self.destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.destination.to_string_lossy().into_owned())
    }

    /// Whether the job re-encodes a file onto its own path.
    pub fn is_in_place(&self) -> bool {
        self.backup_path.as_deref() == Some(self.source.as_path())
    }
}

/// Validates a batch of jobs before scheduling.
///
/// Rejects empty preset chains, presets the resolver does not know, missing
/// source files, destinations shared between jobs and destinations that are
/// another job's source. A job writing onto its own source is allowed. The
/// first problem found is returned.
pub fn validate_jobs(jobs: &[Job], resolver: &dyn PresetResolver) -> Result<(), JobError> {
    let mut destinations: HashSet<&Path> = HashSet::with_capacity(jobs.len());
    let mut sources: HashMap<&Path, usize> = HashMap::with_capacity(jobs.len());
    for job in jobs {
        *sources.entry(job.source.as_path()).or_default() += 1;
    }

    for job in jobs {
        if job.presets.is_empty() {
            return Err(JobError::EmptyPresets(job.source.clone()));
        }

        if let Some(token) = job
            .presets
            .iter()
            .find(|token| resolver.resolve(token).is_none())
        {
            return Err(JobError::UnknownPreset {
                token: token.clone(),
                source_path: job.source.clone(),
            });
        }

        if !job.source.is_file() {
            return Err(JobError::MissingSource(job.source.clone()));
        }

        if !destinations.insert(job.destination.as_path()) {
            return Err(JobError::DuplicateDestination(job.destination.clone()));
        }

        let own = usize::from(job.source == job.destination);
        if sources.get(job.destination.as_path()).copied().unwrap_or(0) > own {
            return Err(JobError::DestinationIsSource(job.destination.clone()));
        }
    }

    Ok(())
}
