//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// External encoder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Program to invoke (default "ffmpeg")
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before the thread flag on every invocation
    #[serde(default)]
    pub global_args: Vec<String>,
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            global_args: Vec::new(),
        }
    }
}

/// Thread budget settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThreadConfig {
    /// Total threads shared by all running jobs (auto-detected if None)
    pub budget: Option<u32>,
}

/// What to do when a job's destination already exists
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Refuse to start the run
    #[default]
    Exit,
    /// Replace the existing file
    Overwrite,
    /// Move the existing file aside and restore it if the job fails
    Backup,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Exit => write!(f, "exit"),
            ConflictPolicy::Overwrite => write!(f, "overwrite"),
            ConflictPolicy::Backup => write!(f, "backup"),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exit" => Ok(ConflictPolicy::Exit),
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            "backup" => Ok(ConflictPolicy::Backup),
            other => Err(format!(
                "unknown conflict policy '{}', expected exit, overwrite or backup",
                other
            )),
        }
    }
}

/// Output naming and post-processing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Destination pattern; `[name]` and `[ext]` are substituted per job
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// Conflict handling for existing destinations (default exit)
    #[serde(default)]
    pub on_conflict: ConflictPolicy,
    /// Copy the source modification time onto finished outputs
    #[serde(default)]
    pub copy_timestamps: bool,
}

fn default_pattern() -> String {
    "[name].[ext]".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            pattern: default_pattern(),
            on_conflict: ConflictPolicy::default(),
            copy_timestamps: false,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub threads: ThreadConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and fills missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - FCONV_ENCODER -> encoder.program
    /// - FCONV_THREADS -> threads.budget
    /// - FCONV_OUTPUT -> output.pattern
    /// - FCONV_ON_CONFLICT -> output.on_conflict
    /// - FCONV_COPY_TIMESTAMPS -> output.copy_timestamps
    /// - FCONV_LOG_LEVEL -> logging.level
    /// - FCONV_LOG_JSON -> logging.json
    ///
    /// Values that fail to parse leave the existing setting untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("FCONV_ENCODER") {
            if !val.trim().is_empty() {
                self.encoder.program = val;
            }
        }

        // A zero budget is never valid, so it is treated like a parse failure
        if let Ok(val) = env::var("FCONV_THREADS") {
            if let Ok(threads) = val.parse::<u32>() {
                if threads > 0 {
                    self.threads.budget = Some(threads);
                }
            }
        }

        if let Ok(val) = env::var("FCONV_OUTPUT") {
            if !val.trim().is_empty() {
                self.output.pattern = val;
            }
        }

        if let Ok(val) = env::var("FCONV_ON_CONFLICT") {
            if let Ok(policy) = val.parse::<ConflictPolicy>() {
                self.output.on_conflict = policy;
            }
        }

        if let Ok(val) = env::var("FCONV_COPY_TIMESTAMPS") {
            if let Some(flag) = parse_flag(&val) {
                self.output.copy_timestamps = flag;
            }
        }

        if let Ok(val) = env::var("FCONV_LOG_LEVEL") {
            if !val.trim().is_empty() {
                self.logging.level = val;
            }
        }

        if let Ok(val) = env::var("FCONV_LOG_JSON") {
            if let Some(flag) = parse_flag(&val) {
                self.logging.json = flag;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from an optional file
    ///
    /// Without a path the defaults are used; environment overrides apply
    /// either way.
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }
}

/// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn parse_flag(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
