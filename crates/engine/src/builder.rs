//! Job builder module for fconv
//!
//! Turns a command line of interleaved files and preset tokens into jobs:
//! arguments are grouped into batches, every file of a batch gets the batch's
//! preset chain, destinations are derived from the output pattern, and
//! existing destinations are handled according to the conflict policy.

use crate::backup::{prepare_destination, restore_backup, BackupError};
use crate::job::{validate_jobs, Job, JobError};
use crate::presets::PresetResolver;
use fconv_config::{ConflictPolicy, OutputConfig};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Placeholder for the source path without extension
pub const NAME_PLACEHOLDER: &str = "[name]";

/// Placeholder for the target extension
pub const EXT_PLACEHOLDER: &str = "[ext]";

/// Errors detected while turning arguments into jobs
#[derive(Debug, Error)]
pub enum BuildError {
    /// Nothing to do
    #[error("No files or presets given")]
    NoArguments,

    /// A batch has files but no presets
    #[error("Presets not specified! (files: {})", .0.join(", "))]
    MissingPresets(Vec<String>),

    /// A batch has presets but no files
    #[error("Files not specified! (presets: {})", .0.join(", "))]
    MissingFiles(Vec<String>),

    /// The output pattern produced a path with the wrong extension
    #[error("Path {path:?} has incorrect extension, expected {expected:?}; use [ext] in the output pattern")]
    WrongExtension { path: PathBuf, expected: String },

    /// The jobs failed validation
    #[error(transparent)]
    Job(#[from] JobError),

    /// An existing destination could not be handled
    #[error(transparent)]
    Backup(#[from] BackupError),
}

/// Files sharing one preset chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub files: Vec<String>,
    pub presets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    File,
    Preset,
}

/// Groups arguments into batches
///
/// An argument the resolver accepts is a preset, anything else a file.
/// Files and presets accumulate in the current batch in either order; once
/// both are present, a change of kind starts the next batch.
pub fn group_arguments(
    args: &[String],
    resolver: &dyn PresetResolver,
) -> Result<Vec<Batch>, BuildError> {
    if args.is_empty() {
        return Err(BuildError::NoArguments);
    }

    let mut batches = Vec::new();
    let mut current = Batch {
        files: Vec::new(),
        presets: Vec::new(),
    };
    let mut last: Option<ArgKind> = None;

    for arg in args {
        let kind = if resolver.resolve(arg).is_some() {
            ArgKind::Preset
        } else {
            ArgKind::File
        };

        let complete = !current.files.is_empty() && !current.presets.is_empty();
        if complete && last.is_some_and(|l| l != kind) {
            batches.push(std::mem::replace(
                &mut current,
                Batch {
                    files: Vec::new(),
                    presets: Vec::new(),
                },
            ));
        }

        match kind {
            ArgKind::Preset => current.presets.push(arg.clone()),
            ArgKind::File => current.files.push(arg.clone()),
        }
        last = Some(kind);
    }

    if current.presets.is_empty() {
        return Err(BuildError::MissingPresets(current.files));
    }
    if current.files.is_empty() {
        return Err(BuildError::MissingFiles(current.presets));
    }
    batches.push(current);

    Ok(batches)
}

/// Builds jobs from arguments according to the output settings
pub struct JobBuilder<'a> {
    resolver: &'a dyn PresetResolver,
    pattern: String,
    policy: ConflictPolicy,
    copy_timestamps: bool,
    cwd: PathBuf,
}

impl<'a> JobBuilder<'a> {
    /// # Arguments
    /// * `resolver` - Preset catalog used to classify arguments
    /// * `output` - Output pattern, conflict policy and timestamp handling
    /// * `cwd` - Directory relative arguments and patterns resolve against
    pub fn new(resolver: &'a dyn PresetResolver, output: &OutputConfig, cwd: impl Into<PathBuf>) -> Self {
        Self {
            resolver,
            pattern: output.pattern.clone(),
            policy: output.on_conflict,
            copy_timestamps: output.copy_timestamps,
            cwd: cwd.into(),
        }
    }

    /// Target extension for a preset chain: the last preset declaring one,
    /// or else the source's own extension
    pub fn target_extension(&self, source: &Path, presets: &[String]) -> String {
        self.resolver
            .chain_extension(presets)
            .or_else(|| {
                source
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
            })
            .unwrap_or_default()
    }

    /// Destination for a source, substituting `[name]` and `[ext]`
    ///
    /// `[name]` is the source path without its extension, relative to the
    /// working directory when the source lies beneath it.
    pub fn destination(&self, source: &Path, presets: &[String]) -> Result<PathBuf, BuildError> {
        let ext = self.target_extension(source, presets);

        let relative = source.strip_prefix(&self.cwd).unwrap_or(source);
        let name = match relative.extension() {
            Some(_) => relative.with_extension(""),
            None => relative.to_path_buf(),
        };

        let rendered = self
            .pattern
            .replace(NAME_PLACEHOLDER, &name.to_string_lossy())
            .replace(EXT_PLACEHOLDER, &ext);
        let destination = self.cwd.join(rendered);

        if ext.is_empty() || !destination.to_string_lossy().ends_with(&format!(".{}", ext)) {
            return Err(BuildError::WrongExtension {
                path: destination,
                expected: ext,
            });
        }

        Ok(destination)
    }

    /// Derives jobs from arguments without touching the file system
    pub fn plan(&self, args: &[String]) -> Result<Vec<Job>, BuildError> {
        let mut jobs = Vec::new();

        for batch in group_arguments(args, self.resolver)? {
            for file in &batch.files {
                let source = self.cwd.join(file);
                let destination = self.destination(&source, &batch.presets)?;
                jobs.push(
                    Job::new(source, destination, batch.presets.clone())
                        .with_copy_timestamps(self.copy_timestamps),
                );
            }
        }

        Ok(jobs)
    }

    /// Derives, validates and prepares jobs
    ///
    /// Existing destinations are moved aside or removed according to the
    /// conflict policy. Under the `exit` policy nothing is moved unless every
    /// destination is free. If preparing a job fails, or the prepared batch
    /// no longer validates, backups made so far are moved back before the
    /// error is returned.
    pub fn build(&self, args: &[String]) -> Result<Vec<Job>, BuildError> {
        let jobs = self.plan(args)?;
        validate_jobs(&jobs, self.resolver)?;

        if self.policy == ConflictPolicy::Exit {
            if let Some(job) = jobs.iter().find(|job| job.destination.exists()) {
                return Err(BackupError::DestinationExists(job.destination.clone()).into());
            }
        }

        let mut prepared: Vec<Job> = Vec::with_capacity(jobs.len());
        for job in jobs {
            match prepare_destination(job, self.policy) {
                Ok(job) => prepared.push(job),
                Err(e) => {
                    roll_back(&prepared);
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = validate_jobs(&prepared, self.resolver) {
            roll_back(&prepared);
            return Err(e.into());
        }

        tracing::debug!(jobs = prepared.len(), policy = %self.policy, "jobs prepared");
        Ok(prepared)
    }
}

/// Moves backups of prepared jobs back to their destinations
///
/// Undoes [`JobBuilder::build`] for a batch that will not be run. Removed
/// destinations under the `overwrite` policy cannot be brought back.
pub fn roll_back(prepared: &[Job]) {
    for job in prepared.iter().rev() {
        if let Some(backup) = &job.backup_path {
            if let Err(e) = restore_backup(backup, &job.destination) {
                tracing::error!(error = %e, "could not undo backup");
            }
        }
    }
}
