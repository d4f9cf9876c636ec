//! fconv media converter
//!
//! Batch front end for ffmpeg: turns files and preset tokens into jobs,
//! shares a thread budget between concurrent encoder processes, reports
//! their progress and protects existing files with backups.

pub mod backup;
pub mod builder;
pub mod concurrency;
pub mod encode;
pub mod error_log;
pub mod job;
pub mod logging;
pub mod presets;
pub mod progress;
pub mod runner;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

pub use backup::{backup_path, prepare_destination, restore_backup, BackupError, BackupKind};
pub use builder::{group_arguments, roll_back, Batch, BuildError, JobBuilder};
pub use concurrency::{default_thread_budget, resolve_budget, Admission};
pub use encode::{build_encode_command, EncodeCommand, Encoder};
pub use error_log::{error_log_path, ErrorLog};
pub use fconv_config as config;
pub use fconv_config::{Config, ConflictPolicy};
pub use job::{validate_jobs, Job, JobError};
pub use logging::init_logging;
pub use presets::{PresetCatalog, PresetListing, PresetResolver, ResolvedPreset};
pub use progress::{parse_timestamp, ParseError, StreamParser};
pub use runner::{
    RunContext, Runner, RunnerError, RunnerEvent, RunnerId, RunnerState, INTERNAL_ERROR_CODE,
};
pub use scheduler::{RunSummary, Scheduler, SchedulerError, SchedulerObserver};
