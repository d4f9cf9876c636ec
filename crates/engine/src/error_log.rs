//! Error log module for failed conversions.
//!
//! Every runner owns an [`ErrorLog`] that records the job, the exact command
//! line and everything the encoder printed on stderr. The buffer is only
//! written to disk when the job does not succeed, as `<destination>.error-log`.

use crate::job::Job;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Constructs the error log path for a destination.
///
/// The log is placed next to the destination with `.error-log` appended.
/// For example: `/media/movie.mp4` -> `/media/movie.mp4.error-log`
pub fn error_log_path(destination: &Path) -> PathBuf {
    let mut log_path = destination.as_os_str().to_owned();
    log_path.push(".error-log");
    PathBuf::from(log_path)
}

/// In-memory log for one encoder invocation.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    buffer: Vec<u8>,
}

impl ErrorLog {
    /// Starts a log with the job record and the command line.
    pub fn new(job: &Job, command_line: &str) -> Self {
        let record = serde_json::to_string_pretty(job)
            .unwrap_or_else(|e| format!("<job could not be serialized: {}>", e));

        let mut buffer = Vec::with_capacity(4096);
        buffer.extend_from_slice(b"fconv media converter log\n");
        buffer.extend_from_slice(b"job:\n");
        buffer.extend_from_slice(record.as_bytes());
        buffer.extend_from_slice(b"\ncommand line:\n");
        buffer.extend_from_slice(command_line.as_bytes());
        buffer.extend_from_slice(b"\n\n");

        Self { buffer }
    }

    /// Appends a raw chunk of encoder output.
    pub fn append(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Appends a note from fconv itself, set apart from encoder output.
    pub fn note(&mut self, message: &str) {
        self.buffer.extend_from_slice(b"\n\nfconv error: ");
        self.buffer.extend_from_slice(message.as_bytes());
        self.buffer.push(b'\n');
    }

    /// Log contents, decoded lossily.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    /// Writes the log next to `destination` and returns its path.
    ///
    /// Encoder output is not guaranteed to be UTF-8; invalid sequences are
    /// replaced so the file is always valid text.
    pub fn write_for(&self, destination: &Path) -> io::Result<PathBuf> {
        let log_path = error_log_path(destination);
        let mut file = File::create(&log_path)?;
        file.write_all(self.contents().as_bytes())?;
        file.sync_all()?;
        Ok(log_path)
    }
}
