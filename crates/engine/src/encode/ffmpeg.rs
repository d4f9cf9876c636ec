//! ffmpeg command module for fconv
//!
//! Builds the command line for one job: global arguments, the thread limit,
//! the input, the flattened preset fragments and finally the destination.

use crate::job::Job;
use crate::presets::PresetResolver;
use fconv_config::EncoderConfig;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Flag limiting the encoder's thread count
pub const THREAD_FLAG: &str = "-threads";

/// Flag introducing the input file
pub const INPUT_FLAG: &str = "-i";

/// The external encoder program and its fixed leading arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Encoder {
    /// Program to execute, looked up in PATH when not absolute
    pub program: PathBuf,
    /// Arguments placed before the thread flag
    pub global_args: Vec<String>,
}

impl Encoder {
    /// Create an encoder without global arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            global_args: Vec::new(),
        }
    }

    /// Replace the global arguments
    pub fn with_global_args(mut self, args: Vec<String>) -> Self {
        self.global_args = args;
        self
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl From<&EncoderConfig> for Encoder {
    fn from(cfg: &EncoderConfig) -> Self {
        Self::new(&cfg.program).with_global_args(cfg.global_args.clone())
    }
}

/// A fully resolved encoder invocation
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl EncodeCommand {
    /// Build a process command with stderr captured
    ///
    /// stdin is closed so the encoder can never wait on an interactive
    /// prompt, and stdout is discarded.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Human readable command line, as recorded in error logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(|a| a.as_os_str()))
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Build the encoder invocation for a job
///
/// Argument order:
/// - global arguments from the encoder configuration
/// - `-threads <threads>`
/// - `-i <source>`
/// - preset fragments, in preset-chain order
/// - the destination path
pub fn build_encode_command(
    encoder: &Encoder,
    job: &Job,
    threads: u32,
    resolver: &dyn PresetResolver,
) -> EncodeCommand {
    let mut args: Vec<OsString> = encoder.global_args.iter().map(OsString::from).collect();

    args.push(THREAD_FLAG.into());
    args.push(threads.to_string().into());

    args.push(INPUT_FLAG.into());
    args.push(job.source.clone().into_os_string());

    args.extend(resolver.chain_args(&job.presets).into_iter().map(OsString::from));

    args.push(job.destination.clone().into_os_string());

    EncodeCommand {
        program: encoder.program.clone(),
        args,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets::PresetCatalog;
    use proptest::prelude::*;
    use std::ffi::OsStr;

    /// Helper to convert args to strings for easier testing
    fn arg_strings(cmd: &EncodeCommand) -> Vec<String> {
        cmd.args
            .iter()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    // Strategy for generating valid path-like strings
    fn path_strategy() -> impl Strategy<Value = String> {
        prop::string::string_regex("/[a-zA-Z0-9_/.-]{1,50}")
            .unwrap()
            .prop_filter("non-empty path", |s| s.len() > 1)
    }

    fn preset_strategy() -> impl Strategy<Value = Vec<String>> {
        proptest::collection::vec(
            prop_oneof![
                Just("mp4".to_string()),
                Just("720p".to_string()),
                Just("mp3".to_string()),
                (1u32..4000, 1u32..4000).prop_map(|(w, h)| format!("{}x{}", w, h)),
            ],
            1..4,
        )
    }

    // Every invocation has the thread flag, the input, the preset fragments
    // in chain order, and ends with the destination.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_command_layout(
            source in path_strategy(),
            destination in path_strategy(),
            threads in 1u32..256,
            presets in preset_strategy(),
        ) {
            let catalog = PresetCatalog::new();
            let job = Job::new(&source, &destination, presets.clone());
            let cmd = build_encode_command(&Encoder::default(), &job, threads, &catalog);
            let args = arg_strings(&cmd);

            prop_assert_eq!(cmd.program.as_os_str(), OsStr::new("ffmpeg"));
            prop_assert_eq!(&args[0], THREAD_FLAG);
            prop_assert_eq!(&args[1], &threads.to_string());
            prop_assert_eq!(&args[2], INPUT_FLAG);
            prop_assert_eq!(&args[3], &source);
            let expected = catalog.chain_args(&presets);
            prop_assert_eq!(&args[4..args.len() - 1], expected.as_slice());
            prop_assert_eq!(args.last().unwrap(), &destination);
        }
    }

    #[test]
    fn test_global_args_come_first() {
        let encoder = Encoder::new("/usr/bin/ffmpeg")
            .with_global_args(vec!["-hide_banner".to_string(), "-nostats".to_string()]);
        let job = Job::new("/in/a.mov", "/out/a.mp4", vec!["720p".to_string()]);

        let cmd = build_encode_command(&encoder, &job, 3, &PresetCatalog::new());

        assert_eq!(
            arg_strings(&cmd),
            vec![
                "-hide_banner",
                "-nostats",
                "-threads",
                "3",
                "-i",
                "/in/a.mov",
                "-vf",
                "scale=1280:-1",
                "/out/a.mp4"
            ]
        );
        assert_eq!(
            cmd.command_line(),
            "/usr/bin/ffmpeg -hide_banner -nostats -threads 3 -i /in/a.mov -vf scale=1280:-1 /out/a.mp4"
        );
    }

    #[test]
    fn test_encoder_from_config() {
        let cfg = EncoderConfig {
            program: "ffmpeg7".to_string(),
            global_args: vec!["-y".to_string()],
        };
        let encoder = Encoder::from(&cfg);
        assert_eq!(encoder.program, PathBuf::from("ffmpeg7"));
        assert_eq!(encoder.global_args, vec!["-y".to_string()]);
    }

    #[tokio::test]
    async fn test_to_command_keeps_program_and_args() {
        let job = Job::new("/in/a.wav", "/out/a.mp3", vec!["mp3".to_string()]);
        let cmd = build_encode_command(&Encoder::default(), &job, 1, &PresetCatalog::new());
        let process = cmd.to_command();

        assert_eq!(process.as_std().get_program(), OsStr::new("ffmpeg"));
        assert_eq!(process.as_std().get_args().count(), cmd.args.len());
    }
}
