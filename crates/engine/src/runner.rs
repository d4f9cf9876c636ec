//! Runner module for fconv
//!
//! A [`Runner`] owns one job and, once started, one encoder process. The
//! process is supervised by a tokio task that streams stderr through the
//! progress parser and the error log, then performs the terminal file work
//! (size accounting, timestamps, source deletion, backup restore, error log)
//! before reporting a single terminal event back to the scheduler.

use crate::backup::{restore_backup, BackupError};
use crate::encode::{build_encode_command, EncodeCommand, Encoder};
use crate::error_log::ErrorLog;
use crate::job::Job;
use crate::presets::PresetResolver;
use crate::progress::{ParseError, StreamParser};
use filetime::FileTime;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Exit code reported when fconv itself failed while finishing a job
pub const INTERNAL_ERROR_CODE: i32 = 1000;

const READ_BUFFER_SIZE: usize = 8192;

/// Index of a runner within its scheduler
pub type RunnerId = usize;

/// Errors that abort supervision of an encoder process
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The destination directory could not be created
    #[error("Failed to create output directory {path:?}: {source}")]
    Prepare { path: PathBuf, source: io::Error },

    /// The encoder could not be launched
    #[error("Failed to start encoder {program:?}: {source}")]
    Spawn { program: PathBuf, source: io::Error },

    /// The encoder's stderr was not captured
    #[error("Encoder stderr was not captured")]
    MissingStderr,

    /// Reading the diagnostic stream failed
    #[error("Failed to read encoder output: {0}")]
    Stream(io::Error),

    /// The diagnostic stream could not be understood
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Waiting for the encoder to exit failed
    #[error("Failed to wait for encoder: {0}")]
    Wait(io::Error),
}

/// Failures in the file work that follows an encoder exit
#[derive(Debug, Error)]
enum FinishError {
    #[error("Failed to inspect {path:?}: {source}")]
    Inspect { path: PathBuf, source: io::Error },

    #[error("Failed to copy timestamps onto {path:?}: {source}")]
    Timestamps { path: PathBuf, source: io::Error },

    #[error("Failed to delete source {path:?}: {source}")]
    DeleteSource { path: PathBuf, source: io::Error },

    #[error("Failed to write error log for {path:?}: {source}")]
    WriteLog { path: PathBuf, source: io::Error },

    #[error("Failed to remove partial output {path:?}: {source}")]
    RemovePartial { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Backup(#[from] BackupError),
}

/// Lifecycle of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Not started yet
    Idle,
    /// Encoder process is running
    Running,
    /// Encoder exited with status 0 and all follow-up work completed
    Succeeded,
    /// Encoder or fconv failed
    Failed,
    /// Stopped by the scheduler before reaching a result
    Cancelled,
}

impl RunnerState {
    /// Convert state to string for display
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerState::Idle => "idle",
            RunnerState::Running => "running",
            RunnerState::Succeeded => "succeeded",
            RunnerState::Failed => "failed",
            RunnerState::Cancelled => "cancelled",
        }
    }

    /// Whether the runner can no longer change state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunnerState::Succeeded | RunnerState::Failed | RunnerState::Cancelled
        )
    }
}

/// Notification from a supervision task
///
/// Any number of `Progress` events may be sent, followed by at most one
/// terminal event. A cancelled runner sends no terminal event.
#[derive(Debug)]
pub enum RunnerEvent {
    /// New progress ratio in `[0, 1]`
    Progress(f64),
    /// Encoder finished and the follow-up work succeeded
    Success { size_before: u64, size_after: u64 },
    /// Encoder exit code was non-zero, or [`INTERNAL_ERROR_CODE`]
    Failure { exit_code: i32 },
    /// Supervision aborted; the process was stopped and cleaned up
    Fault(RunnerError),
}

impl RunnerEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunnerEvent::Progress(_))
    }
}

/// A runner event tagged with its origin
#[derive(Debug)]
pub struct RunnerMessage {
    pub id: RunnerId,
    pub event: RunnerEvent,
}

/// What every runner of a batch needs to launch its process
#[derive(Clone)]
pub struct RunContext {
    pub encoder: Encoder,
    pub resolver: Arc<dyn PresetResolver>,
}

impl RunContext {
    pub fn new(encoder: Encoder, resolver: Arc<dyn PresetResolver>) -> Self {
        Self { encoder, resolver }
    }
}

/// One job and the state of its encoder process
#[derive(Debug)]
pub struct Runner {
    id: RunnerId,
    job: Job,
    state: RunnerState,
    progress: f64,
    threads: u32,
    size_before: u64,
    size_after: u64,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Runner {
    pub fn new(id: RunnerId, job: Job) -> Self {
        Self {
            id,
            job,
            state: RunnerState::Idle,
            progress: 0.0,
            threads: 0,
            size_before: 0,
            size_after: 0,
            cancel: None,
            task: None,
        }
    }

    pub fn id(&self) -> RunnerId {
        self.id
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Last reported progress, in `[0, 1]`
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Threads the runner was started with, 0 before start
    pub fn threads(&self) -> u32 {
        self.threads
    }

    pub fn size_before(&self) -> u64 {
        self.size_before
    }

    pub fn size_after(&self) -> u64 {
        self.size_after
    }

    /// Launches the encoder with `threads` threads
    ///
    /// Events for this runner are sent on `events`, tagged with its id.
    /// Returns `false`, doing nothing, if the runner was already started.
    pub fn start(
        &mut self,
        threads: u32,
        ctx: &RunContext,
        events: mpsc::UnboundedSender<RunnerMessage>,
    ) -> bool {
        if self.state != RunnerState::Idle {
            return false;
        }

        let command = build_encode_command(&ctx.encoder, &self.job, threads, ctx.resolver.as_ref());
        let (cancel_tx, cancel_rx) = oneshot::channel();

        tracing::info!(
            runner = self.id,
            threads,
            command = %command.command_line(),
            "starting encoder"
        );

        let task = Supervisor {
            id: self.id,
            job: self.job.clone(),
            command,
            events,
            cancel: cancel_rx,
        };

        self.task = Some(tokio::spawn(task.run()));
        self.cancel = Some(cancel_tx);
        self.threads = threads;
        self.state = RunnerState::Running;
        true
    }

    /// Folds an event from this runner's task into its state
    ///
    /// Returns `false` if the event was ignored because the runner is not
    /// running, which happens for events still in flight after a cancel.
    pub fn apply(&mut self, event: &RunnerEvent) -> bool {
        if self.state != RunnerState::Running {
            return false;
        }

        match event {
            RunnerEvent::Progress(progress) => {
                if progress.is_finite() {
                    self.progress = progress.clamp(0.0, 1.0);
                }
            }
            RunnerEvent::Success {
                size_before,
                size_after,
            } => {
                self.size_before = *size_before;
                self.size_after = *size_after;
                self.progress = 1.0;
                self.state = RunnerState::Succeeded;
                self.cancel = None;
            }
            RunnerEvent::Failure { .. } | RunnerEvent::Fault(_) => {
                self.state = RunnerState::Failed;
                self.cancel = None;
            }
        }
        true
    }

    /// Stops a running encoder
    ///
    /// The process is killed, the backup is restored and partial output is
    /// removed; no terminal event follows. Returns `false` if the runner was
    /// not running.
    pub fn cancel(&mut self) -> bool {
        if self.state != RunnerState::Running {
            return false;
        }
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.state = RunnerState::Cancelled;
        tracing::info!(runner = self.id, "cancelled encoder");
        true
    }

    /// Waits until the supervision task has finished its cleanup
    pub async fn wait(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(runner = self.id, error = %e, "supervision task panicked");
            }
        }
    }
}

/// How supervision of a process ended
enum Exit {
    Status(i32),
    Cancelled,
}

/// Owned state of one supervision task
struct Supervisor {
    id: RunnerId,
    job: Job,
    command: EncodeCommand,
    events: mpsc::UnboundedSender<RunnerMessage>,
    cancel: oneshot::Receiver<()>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut log = ErrorLog::new(&self.job, &self.command.command_line());

        let size_before = match tokio::fs::metadata(&self.job.source).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::warn!(
                    runner = self.id,
                    source = %self.job.source.display(),
                    error = %e,
                    "could not read source size"
                );
                0
            }
        };

        let mut child = match self.launch().await {
            Ok(child) => child,
            Err(error) => return self.fault(error, log).await,
        };

        let exit = match self.watch(&mut child, &mut log).await {
            Ok(exit) => exit,
            Err(error) => {
                stop(&mut child).await;
                return self.fault(error, log).await;
            }
        };

        match exit {
            Exit::Cancelled => {
                stop(&mut child).await;
                let job = self.job;
                let _ = tokio::task::spawn_blocking(move || discard_output(&job)).await;
            }
            Exit::Status(code) => {
                tracing::info!(runner = self.id, exit_code = code, "encoder exited");
                let job = self.job.clone();
                let event = tokio::task::spawn_blocking(move || conclude(&job, code, size_before, log))
                    .await
                    .unwrap_or_else(|e| {
                        tracing::error!(runner = self.id, error = %e, "finishing task panicked");
                        RunnerEvent::Failure {
                            exit_code: INTERNAL_ERROR_CODE,
                        }
                    });
                self.send(event);
            }
        }
    }

    async fn launch(&self) -> Result<Child, RunnerError> {
        if let Some(parent) = self.job.destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| RunnerError::Prepare {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let child = self
            .command
            .to_command()
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;

        tracing::debug!(runner = self.id, pid = ?child.id(), "encoder spawned");
        Ok(child)
    }

    /// Streams stderr until the process exits or a cancel arrives
    async fn watch(&mut self, child: &mut Child, log: &mut ErrorLog) -> Result<Exit, RunnerError> {
        let mut stderr: ChildStderr = child.stderr.take().ok_or(RunnerError::MissingStderr)?;
        let mut parser = StreamParser::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = &mut self.cancel => return Ok(Exit::Cancelled),
                read = stderr.read(&mut buf) => {
                    let n = read.map_err(RunnerError::Stream)?;
                    if n == 0 {
                        break;
                    }
                    let chunk = &buf[..n];
                    log.append(chunk);
                    for progress in parser.feed(chunk)? {
                        self.send(RunnerEvent::Progress(progress));
                    }
                }
            }
        }

        tokio::select! {
            _ = &mut self.cancel => Ok(Exit::Cancelled),
            status = child.wait() => {
                let status = status.map_err(RunnerError::Wait)?;
                Ok(Exit::Status(exit_code(status)))
            }
        }
    }

    async fn fault(self, error: RunnerError, mut log: ErrorLog) {
        tracing::warn!(runner = self.id, error = %error, "encoder supervision failed");
        log.note(&error.to_string());

        let job = self.job.clone();
        let _ = tokio::task::spawn_blocking(move || {
            recover(&job, &mut log);
        })
        .await;

        self.send(RunnerEvent::Fault(error));
    }

    fn send(&self, event: RunnerEvent) {
        // The scheduler may already be gone during shutdown
        let _ = self.events.send(RunnerMessage { id: self.id, event });
    }
}

/// Kills the process and reaps it
async fn stop(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "encoder already exited");
    }
    let _ = child.wait().await;
}

/// Maps a process status to an exit code; signals become `128 + signal`
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}

/// Terminal file work after the encoder exited with `code`
fn conclude(job: &Job, code: i32, size_before: u64, mut log: ErrorLog) -> RunnerEvent {
    if code == 0 {
        return match finish_success(job) {
            Ok(size_after) => RunnerEvent::Success {
                size_before,
                size_after,
            },
            Err(e) => {
                tracing::error!(destination = %job.destination.display(), error = %e, "finishing job failed");
                log.note(&e.to_string());
                recover_internal(job, &mut log);
                RunnerEvent::Failure {
                    exit_code: INTERNAL_ERROR_CODE,
                }
            }
        };
    }

    let exit_code = if recover(job, &mut log) {
        code
    } else {
        INTERNAL_ERROR_CODE
    };
    RunnerEvent::Failure { exit_code }
}

fn finish_success(job: &Job) -> Result<u64, FinishError> {
    let size_after = fs::metadata(&job.destination)
        .map_err(|source| FinishError::Inspect {
            path: job.destination.clone(),
            source,
        })?
        .len();

    if job.copy_timestamps_on_success {
        let source_meta = fs::metadata(&job.source).map_err(|source| FinishError::Inspect {
            path: job.source.clone(),
            source,
        })?;
        let mtime = FileTime::from_last_modification_time(&source_meta);
        filetime::set_file_times(&job.destination, FileTime::now(), mtime).map_err(|source| {
            FinishError::Timestamps {
                path: job.destination.clone(),
                source,
            }
        })?;
    }

    if job.delete_source_on_success {
        fs::remove_file(&job.source).map_err(|source| FinishError::DeleteSource {
            path: job.source.clone(),
            source,
        })?;
        tracing::info!(source = %job.source.display(), "deleted source");
    }

    Ok(size_after)
}

/// Failure cleanup: restore the backup, write the log, drop partial output
fn recover_failure(job: &Job, log: &ErrorLog) -> Result<(), FinishError> {
    let restored = match &job.backup_path {
        Some(backup) => {
            restore_backup(backup, &job.destination)?;
            true
        }
        None => false,
    };

    let log_path = log
        .write_for(&job.destination)
        .map_err(|source| FinishError::WriteLog {
            path: job.destination.clone(),
            source,
        })?;
    tracing::warn!(log = %log_path.display(), "wrote error log");

    if !restored && job.destination.exists() {
        fs::remove_file(&job.destination).map_err(|source| FinishError::RemovePartial {
            path: job.destination.clone(),
            source,
        })?;
    }

    Ok(())
}

/// Runs failure cleanup, falling back to best effort on internal errors.
/// Returns `false` if an internal error occurred.
fn recover(job: &Job, log: &mut ErrorLog) -> bool {
    match recover_failure(job, log) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(destination = %job.destination.display(), error = %e, "failure cleanup failed");
            log.note(&e.to_string());
            recover_internal(job, log);
            false
        }
    }
}

/// Best-effort cleanup after an internal error; every step is attempted
fn recover_internal(job: &Job, log: &ErrorLog) {
    let restored = job
        .backup_path
        .as_deref()
        .filter(|backup| backup.exists())
        .map(|backup| match restore_backup(backup, &job.destination) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "backup restore failed");
                false
            }
        })
        .unwrap_or(false);

    if !restored && job.destination.exists() {
        if let Err(e) = fs::remove_file(&job.destination) {
            tracing::error!(destination = %job.destination.display(), error = %e, "could not remove output");
        }
    }

    if let Err(e) = log.write_for(&job.destination) {
        tracing::error!(destination = %job.destination.display(), error = %e, "could not write error log");
    }
}

/// Cancel cleanup: put the backup back or drop partial output, without a log
fn discard_output(job: &Job) {
    if let Some(backup) = job.backup_path.as_deref().filter(|b| b.exists()) {
        if let Err(e) = restore_backup(backup, &job.destination) {
            tracing::error!(error = %e, "backup restore after cancel failed");
        }
        return;
    }

    if job.destination.exists() {
        if let Err(e) = fs::remove_file(&job.destination) {
            tracing::error!(destination = %job.destination.display(), error = %e, "could not remove output");
        }
    }
}
