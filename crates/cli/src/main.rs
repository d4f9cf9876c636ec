//! CLI entry point for the fconv media converter
//!
//! Parses files and presets, prepares jobs and runs them with a live
//! progress display.

mod render;

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use fconv::{
    init_logging, resolve_budget, roll_back, Config, ConflictPolicy, Encoder, Job, JobBuilder,
    PresetCatalog, RunContext, RunSummary, Scheduler,
};
use render::Renderer;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// f - batch media converter built on ffmpeg
///
/// Files followed by presets form a batch; several batches may be given,
/// e.g. `f a.mov b.mov mp4 720p c.wav mp3`.
#[derive(Parser, Debug)]
#[command(name = "f")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files and preset tokens
    #[arg(required_unless_present = "list_presets")]
    args: Vec<String>,

    /// ffmpeg command to run
    #[arg(short = 'f', long = "ffmpeg")]
    ffmpeg: Option<String>,

    /// Output path pattern; [name] is the source without extension, [ext] the target extension
    #[arg(short, long)]
    output: Option<String>,

    /// Thread budget, which also bounds the number of jobs at once
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    threads: Option<u32>,

    /// Path to a configuration file (config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// What to do with existing destinations: exit, overwrite or backup
    #[arg(long)]
    on_conflict: Option<ConflictPolicy>,

    /// Copy the source modification time onto each output
    #[arg(long)]
    copy_timestamps: bool,

    /// List available presets and exit
    #[arg(long)]
    list_presets: bool,
}

impl Args {
    /// Command line flags take precedence over file and environment settings
    fn apply_to(&self, config: &mut Config) {
        if let Some(program) = &self.ffmpeg {
            config.encoder.program = program.clone();
        }
        if let Some(pattern) = &self.output {
            config.output.pattern = pattern.clone();
        }
        if let Some(threads) = self.threads {
            config.threads.budget = Some(threads);
        }
        if let Some(policy) = self.on_conflict {
            config.output.on_conflict = policy;
        }
        if self.copy_timestamps {
            config.output.copy_timestamps = true;
        }
    }
}

fn print_presets(catalog: &PresetCatalog) {
    println!("Presets:");
    for preset in catalog.listing() {
        println!(
            "    {} - {}",
            style(preset.names).green().bright(),
            preset.description
        );
    }
}

/// Resolves when the user asks to stop
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("cannot listen for Ctrl-C, interruption disabled");
        std::future::pending::<()>().await;
    }
}

/// Creates the scheduler for prepared jobs, undoing their preparation if
/// the batch is rejected
fn schedule(jobs: Vec<Job>, budget: u32, ctx: RunContext) -> Result<Scheduler> {
    match Scheduler::new(jobs.clone(), budget, ctx) {
        Ok(scheduler) => Ok(scheduler),
        Err(e) => {
            roll_back(&jobs);
            Err(e).context("Failed to schedule jobs")
        }
    }
}

async fn run(args: Args) -> Result<RunSummary> {
    let catalog = Arc::new(PresetCatalog::new());
    if args.list_presets {
        print_presets(&catalog);
        return Ok(RunSummary::default());
    }

    let mut config = Config::load_or_default(args.config.as_ref())
        .context("Failed to load configuration")?;
    args.apply_to(&mut config);
    init_logging(&config.logging);

    let cwd = std::env::current_dir().context("Failed to read the working directory")?;
    let jobs = JobBuilder::new(catalog.as_ref(), &config.output, cwd).build(&args.args)?;

    let budget = resolve_budget(&config.threads);
    tracing::info!(jobs = jobs.len(), budget, "starting batch");

    let ctx = RunContext::new(Encoder::from(&config.encoder), catalog);
    let mut scheduler = schedule(jobs, budget, ctx)?;
    let mut renderer = Renderer::new();

    Ok(scheduler.run_until(&mut renderer, interrupted()).await)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {:#}", style("Error:").red().bright().bold(), e);
            ExitCode::FAILURE
        }
    }
}
