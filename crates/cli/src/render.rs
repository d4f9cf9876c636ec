//! Terminal renderer for the `f` binary
//!
//! One progress bar per running job plus a queue line, drawn with indicatif.
//! Finished jobs are printed above the bars.

use console::{style, Term};
use fconv::{RunSummary, Runner, RunnerError, RunnerId, Scheduler, SchedulerObserver};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;

/// Bar resolution; progress ratios are scaled to this length
const BAR_LENGTH: u64 = 1000;

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg:.magenta.bright} {percent:>3}% {wide_bar:.green/blue}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏ ")
}

/// Size comparison shown for a finished job
///
/// `1.00 MiB --> 512.00 KiB (50.0% size of original)`
pub fn size_report(before: u64, after: u64) -> String {
    let sizes = format!("{} --> {}", HumanBytes(before), HumanBytes(after));
    if before == 0 {
        return sizes;
    }

    let percent = after as f64 / before as f64 * 100.0;
    let larger = if after > before { ", larger!!!" } else { "" };
    format!("{} ({:.1}% size of original{})", sizes, percent, larger)
}

/// Queue line text, empty when nothing is waiting
pub fn queue_message(queued: usize) -> String {
    if queued == 0 {
        String::new()
    } else {
        format!("and {} more files in queue.", queued)
    }
}

/// Draws scheduler state to the terminal
pub struct Renderer {
    multi: MultiProgress,
    bars: HashMap<RunnerId, ProgressBar>,
    queue_line: ProgressBar,
}

impl Renderer {
    pub fn new() -> Self {
        let target = if Term::stdout().is_term() {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        };
        let multi = MultiProgress::with_draw_target(target);
        let queue_line = multi.add(ProgressBar::new_spinner());
        queue_line.set_style(
            ProgressStyle::with_template("{msg:.dim}").unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );

        Self {
            multi,
            bars: HashMap::new(),
            queue_line,
        }
    }

    /// Prints a line above the bars, or plainly when bars are hidden
    fn line(&self, text: String) {
        if self.multi.is_hidden() {
            println!("{}", text);
        } else if self.multi.println(text).is_err() {
            tracing::debug!("terminal write failed");
        }
    }

    /// Adds bars for newly admitted runners and refreshes the queue line
    fn sync(&mut self, scheduler: &Scheduler) {
        for runner in scheduler.running() {
            if self.bars.contains_key(&runner.id()) {
                continue;
            }
            let bar = self
                .multi
                .insert_before(&self.queue_line, ProgressBar::new(BAR_LENGTH));
            bar.set_style(bar_style());
            bar.set_message(runner.job().display_name());
            bar.set_position(position(runner));
            self.bars.insert(runner.id(), bar);
        }
        self.queue_line.set_message(queue_message(scheduler.queued()));
    }

    fn remove(&mut self, id: RunnerId) {
        if let Some(bar) = self.bars.remove(&id) {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

fn position(runner: &Runner) -> u64 {
    (runner.progress() * BAR_LENGTH as f64).round() as u64
}

impl SchedulerObserver for Renderer {
    fn started(&mut self, scheduler: &Scheduler) {
        let total = scheduler.runners().len();
        self.line(format!(
            "fconv media converter, {} job{} queued.\n",
            total,
            if total == 1 { "" } else { "s" }
        ));
        self.sync(scheduler);
    }

    fn progress(&mut self, _scheduler: &Scheduler, runner: &Runner) {
        if let Some(bar) = self.bars.get(&runner.id()) {
            bar.set_position(position(runner));
        }
    }

    fn success(&mut self, _scheduler: &Scheduler, runner: &Runner) {
        self.remove(runner.id());
        self.line(format!(
            "{} {} {}",
            style(runner.job().display_name()).green().bright(),
            style("DONE!").green().bright(),
            style(size_report(runner.size_before(), runner.size_after())).green(),
        ));
    }

    fn failure(&mut self, _scheduler: &Scheduler, runner: &Runner, exit_code: i32) {
        self.remove(runner.id());
        self.line(format!(
            "{} {} {}",
            style(runner.job().display_name()).red().bright(),
            style("FAILED!").red().bright(),
            style(format!("FFmpeg exited with error code {}.", exit_code)).red(),
        ));
    }

    fn fault(&mut self, _scheduler: &Scheduler, runner: &Runner, error: &RunnerError) {
        self.remove(runner.id());
        self.line(format!(
            "{} {} {}",
            style(runner.job().display_name()).red().bright(),
            style("FAILED!").red().bright(),
            style(error).red(),
        ));
    }

    fn queue_changed(&mut self, scheduler: &Scheduler) {
        self.sync(scheduler);
    }

    fn shutting_down(&mut self, _scheduler: &Scheduler) {
        self.line(style("Interrupted, stopping running jobs...").yellow().to_string());
    }

    fn finished(&mut self, _scheduler: &Scheduler, summary: &RunSummary) {
        for (_, bar) in self.bars.drain() {
            bar.finish_and_clear();
        }
        self.queue_line.finish_and_clear();

        if summary.cancelled > 0 {
            self.line(format!("{} jobs cancelled.", summary.cancelled));
        }
        self.line("Done Encoding!\n".to_string());
    }
}
