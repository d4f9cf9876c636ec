//! Scheduler module for fconv
//!
//! Owns every runner of a batch, admits them against the thread budget and
//! forwards their events to a [`SchedulerObserver`]. All runner state is
//! mutated from the scheduler's own task; supervision tasks only send
//! messages over a channel.

use crate::concurrency::Admission;
use crate::job::{validate_jobs, Job, JobError};
use crate::runner::{RunContext, Runner, RunnerError, RunnerEvent, RunnerId, RunnerMessage, RunnerState};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for scheduler construction
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A thread budget of zero can never admit a job
    #[error("Thread budget must be at least 1")]
    ZeroBudget,

    /// The batch failed validation
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Outcome counts for a finished batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub faulted: usize,
    pub cancelled: usize,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.faulted + self.cancelled
    }

    /// Whether every job succeeded
    pub fn is_success(&self) -> bool {
        self.total() == self.succeeded
    }
}

/// Receives scheduler notifications, in the order they happen
///
/// Every method has an empty default so observers only implement what they
/// display. `()` is the observer that ignores everything.
pub trait SchedulerObserver {
    /// Initial admission is done
    fn started(&mut self, _scheduler: &Scheduler) {}

    fn progress(&mut self, _scheduler: &Scheduler, _runner: &Runner) {}

    fn success(&mut self, _scheduler: &Scheduler, _runner: &Runner) {}

    fn failure(&mut self, _scheduler: &Scheduler, _runner: &Runner, _exit_code: i32) {}

    fn fault(&mut self, _scheduler: &Scheduler, _runner: &Runner, _error: &RunnerError) {}

    /// A runner completed and the running set and queue were updated
    fn queue_changed(&mut self, _scheduler: &Scheduler) {}

    /// Shutdown was requested; running jobs are being cancelled
    fn shutting_down(&mut self, _scheduler: &Scheduler) {}

    /// Nothing is running or queued any more
    fn finished(&mut self, _scheduler: &Scheduler, _summary: &RunSummary) {}
}

impl SchedulerObserver for () {}

/// Admits runners against a thread budget and tracks them to completion
pub struct Scheduler {
    runners: Vec<Runner>,
    queue: VecDeque<RunnerId>,
    running: Vec<RunnerId>,
    admission: Admission,
    budget: u32,
    ctx: RunContext,
    events_tx: mpsc::UnboundedSender<RunnerMessage>,
    events_rx: mpsc::UnboundedReceiver<RunnerMessage>,
    summary: RunSummary,
    started: bool,
}

impl Scheduler {
    /// Create a scheduler for a validated batch
    ///
    /// # Arguments
    /// * `jobs` - Jobs in queue order
    /// * `budget` - Total encoder threads allowed at once
    /// * `ctx` - Encoder and preset catalog shared by every runner
    ///
    /// # Returns
    /// * `Ok(Scheduler)` - Every job is queued, nothing is started
    /// * `Err(SchedulerError)` - Zero budget or a job failed validation
    pub fn new(jobs: Vec<Job>, budget: u32, ctx: RunContext) -> Result<Self, SchedulerError> {
        if budget == 0 {
            return Err(SchedulerError::ZeroBudget);
        }
        validate_jobs(&jobs, ctx.resolver.as_ref())?;

        let admission = Admission::plan(jobs.len(), budget);
        let runners: Vec<Runner> = jobs
            .into_iter()
            .enumerate()
            .map(|(id, job)| Runner::new(id, job))
            .collect();
        let queue = (0..runners.len()).collect();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tracing::debug!(jobs = runners.len(), budget, ?admission, "scheduler created");

        Ok(Self {
            runners,
            queue,
            running: Vec::new(),
            admission,
            budget,
            ctx,
            events_tx,
            events_rx,
            summary: RunSummary::default(),
            started: false,
        })
    }

    pub fn runners(&self) -> &[Runner] {
        &self.runners
    }

    pub fn runner(&self, id: RunnerId) -> Option<&Runner> {
        self.runners.get(id)
    }

    /// Running runners, in admission order
    pub fn running(&self) -> impl Iterator<Item = &Runner> + '_ {
        self.running.iter().map(move |&id| &self.runners[id])
    }

    pub fn is_running(&self, id: RunnerId) -> bool {
        self.runners
            .get(id)
            .map(|r| r.state() == RunnerState::Running)
            .unwrap_or(false)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Number of jobs still waiting for admission
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Sum of the threads of every running runner
    pub fn threads_in_use(&self) -> u32 {
        self.running().map(Runner::threads).sum()
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Whether nothing is running or queued
    pub fn is_finished(&self) -> bool {
        self.running.is_empty() && self.queue.is_empty()
    }

    /// Performs the initial admission. Calling it again does nothing.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        for threads in self.admission.initial_allocations() {
            if !self.admit_next(threads) {
                break;
            }
        }
    }

    /// Runs the batch to completion
    pub async fn run(&mut self, observer: &mut dyn SchedulerObserver) -> RunSummary {
        self.run_until(observer, std::future::pending::<()>()).await
    }

    /// Runs the batch until it completes or `shutdown` resolves
    ///
    /// On shutdown, queued jobs are dropped and running jobs are cancelled;
    /// both count as cancelled in the summary. Returns once every
    /// supervision task has finished its cleanup.
    pub async fn run_until<F>(&mut self, observer: &mut dyn SchedulerObserver, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        self.start();
        observer.started(self);

        tokio::pin!(shutdown);

        while !self.is_finished() {
            tokio::select! {
                _ = &mut shutdown => {
                    observer.shutting_down(self);
                    self.cancel_all(observer).await;
                    break;
                }
                message = self.events_rx.recv() => {
                    // The scheduler holds a sender, so the channel stays open
                    let Some(message) = message else { break };
                    self.handle(message, observer);
                }
            }
        }

        tracing::info!(
            succeeded = self.summary.succeeded,
            failed = self.summary.failed,
            faulted = self.summary.faulted,
            cancelled = self.summary.cancelled,
            "batch finished"
        );
        let this = &*self;
        observer.finished(this, &this.summary);
        self.summary
    }

    fn handle(&mut self, message: RunnerMessage, observer: &mut dyn SchedulerObserver) {
        let RunnerMessage { id, event } = message;
        let Some(runner) = self.runners.get_mut(id) else {
            return;
        };
        if !runner.apply(&event) {
            return;
        }

        match &event {
            RunnerEvent::Progress(_) => {
                let this = &*self;
                observer.progress(this, &this.runners[id]);
                return;
            }
            RunnerEvent::Success { .. } => {
                self.summary.succeeded += 1;
                let this = &*self;
                observer.success(this, &this.runners[id]);
            }
            RunnerEvent::Failure { exit_code } => {
                self.summary.failed += 1;
                tracing::warn!(runner = id, exit_code, "job failed");
                let this = &*self;
                observer.failure(this, &this.runners[id], *exit_code);
            }
            RunnerEvent::Fault(error) => {
                self.summary.faulted += 1;
                tracing::error!(runner = id, error = %error, "job faulted");
                let this = &*self;
                observer.fault(this, &this.runners[id], error);
            }
        }

        self.complete(id);
        observer.queue_changed(self);
    }

    /// Removes a finished runner from the running set and refills
    fn complete(&mut self, id: RunnerId) {
        self.running.retain(|&r| r != id);

        if self.admission.refills() {
            self.admit_next(self.admission.refill_threads());
        }
    }

    /// Starts the runner at the head of the queue. Returns `false` if the
    /// queue was empty.
    fn admit_next(&mut self, threads: u32) -> bool {
        let Some(id) = self.queue.pop_front() else {
            return false;
        };

        if self.runners[id].start(threads, &self.ctx, self.events_tx.clone()) {
            self.running.push(id);
        }
        true
    }

    /// Drops the queue and cancels running runners. Outcomes that already
    /// arrived are recorded first, so finished jobs are not counted as
    /// cancelled.
    async fn cancel_all(&mut self, observer: &mut dyn SchedulerObserver) {
        let dropped = self.queue.len();
        self.queue.clear();
        self.summary.cancelled += dropped;

        while let Ok(message) = self.events_rx.try_recv() {
            self.handle(message, observer);
        }

        let running: Vec<RunnerId> = std::mem::take(&mut self.running);
        for &id in &running {
            if self.runners[id].cancel() {
                self.summary.cancelled += 1;
            }
        }
        for &id in &running {
            self.runners[id].wait().await;
        }

        tracing::info!(dropped, cancelled = running.len(), "scheduler shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{script_context, standard_script};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(30);

    /// Observer recording what a renderer would see
    #[derive(Default)]
    struct Recorder {
        started_running: usize,
        started_queued: usize,
        admitted: Vec<RunnerId>,
        max_threads: u32,
        progress_events: usize,
        successes: Vec<RunnerId>,
        failures: Vec<(RunnerId, i32)>,
        faults: usize,
        shutdown_seen: bool,
        finished: Option<RunSummary>,
    }

    impl Recorder {
        fn observe(&mut self, scheduler: &Scheduler) {
            for runner in scheduler.running() {
                if !self.admitted.contains(&runner.id()) {
                    self.admitted.push(runner.id());
                }
            }
            self.max_threads = self.max_threads.max(scheduler.threads_in_use());
            assert!(scheduler.threads_in_use() <= scheduler.budget());
        }
    }

    impl SchedulerObserver for Recorder {
        fn started(&mut self, scheduler: &Scheduler) {
            self.started_running = scheduler.running_count();
            self.started_queued = scheduler.queued();
            self.observe(scheduler);
        }

        fn progress(&mut self, scheduler: &Scheduler, runner: &Runner) {
            assert!((0.0..=1.0).contains(&runner.progress()));
            self.progress_events += 1;
            self.observe(scheduler);
        }

        fn success(&mut self, _scheduler: &Scheduler, runner: &Runner) {
            self.successes.push(runner.id());
        }

        fn failure(&mut self, _scheduler: &Scheduler, runner: &Runner, exit_code: i32) {
            self.failures.push((runner.id(), exit_code));
        }

        fn fault(&mut self, _scheduler: &Scheduler, _runner: &Runner, _error: &RunnerError) {
            self.faults += 1;
        }

        fn queue_changed(&mut self, scheduler: &Scheduler) {
            let pending = scheduler.running_count() + scheduler.queued();
            if scheduler.admission().refills() {
                // Refill keeps every slot busy while work remains
                assert_eq!(
                    scheduler.running_count(),
                    pending.min(scheduler.budget() as usize)
                );
            }
            self.observe(scheduler);
        }

        fn shutting_down(&mut self, _scheduler: &Scheduler) {
            self.shutdown_seen = true;
        }

        fn finished(&mut self, scheduler: &Scheduler, summary: &RunSummary) {
            assert!(scheduler.is_finished());
            self.finished = Some(*summary);
        }
    }

    fn sources(dir: &Path, count: usize) -> Vec<(PathBuf, PathBuf)> {
        (0..count)
            .map(|i| {
                let src = dir.join(format!("clip{}.mov", i));
                fs::write(&src, format!("source {}", i)).unwrap();
                (src, dir.join("out").join(format!("clip{}.mp4", i)))
            })
            .collect()
    }

    fn jobs_with(pairs: &[(PathBuf, PathBuf)], presets: &[&str]) -> Vec<Job> {
        pairs
            .iter()
            .map(|(src, dest)| Job::new(src, dest, presets.iter().map(|p| p.to_string()).collect()))
            .collect()
    }

    #[tokio::test]
    async fn test_empty_batch_finishes_immediately() {
        let dir = TempDir::new().unwrap();
        let ctx = script_context(dir.path(), &standard_script("0", 1));
        let mut scheduler = Scheduler::new(Vec::new(), 4, ctx).unwrap();
        let mut recorder = Recorder::default();

        let summary = timeout(WAIT, scheduler.run(&mut recorder)).await.unwrap();

        assert_eq!(summary, RunSummary::default());
        assert!(summary.is_success());
        assert_eq!(recorder.finished, Some(RunSummary::default()));
    }

    #[test]
    fn test_rejects_zero_budget() {
        let dir = TempDir::new().unwrap();
        let ctx = script_context(dir.path(), &standard_script("0", 1));
        let result = Scheduler::new(Vec::new(), 0, ctx);
        assert!(matches!(result, Err(SchedulerError::ZeroBudget)));
    }

    #[test]
    fn test_rejects_invalid_batch() {
        let dir = TempDir::new().unwrap();
        let pairs = sources(dir.path(), 2);
        let mut jobs = jobs_with(&pairs, &["mp4"]);
        jobs[1].destination = jobs[0].destination.clone();
        let ctx = script_context(dir.path(), &standard_script("0", 1));

        let result = Scheduler::new(jobs, 2, ctx);
        assert!(matches!(
            result,
            Err(SchedulerError::Job(JobError::DuplicateDestination(_)))
        ));
    }

    #[tokio::test]
    async fn test_more_jobs_than_threads_refills_in_order() {
        let dir = TempDir::new().unwrap();
        let pairs = sources(dir.path(), 5);
        let ctx = script_context(dir.path(), &standard_script("0.2", 1));
        let mut scheduler = Scheduler::new(jobs_with(&pairs, &["mp4"]), 2, ctx).unwrap();
        let mut recorder = Recorder::default();

        let summary = timeout(WAIT, scheduler.run(&mut recorder)).await.unwrap();

        assert_eq!(recorder.started_running, 2);
        assert_eq!(recorder.started_queued, 3);
        assert_eq!(recorder.admitted, vec![0, 1, 2, 3, 4]);
        assert_eq!(recorder.max_threads, 2);
        assert!(recorder.progress_events >= 5);
        assert_eq!(summary.succeeded, 5);
        assert!(summary.is_success());
        for (_, dest) in &pairs {
            assert_eq!(fs::read_to_string(dest).unwrap(), "1");
        }
        assert!(scheduler
            .runners()
            .iter()
            .all(|r| r.state() == RunnerState::Succeeded && r.threads() == 1));
    }

    #[tokio::test]
    async fn test_fewer_jobs_than_threads_partitions_budget() {
        let dir = TempDir::new().unwrap();
        let pairs = sources(dir.path(), 2);
        let ctx = script_context(dir.path(), &standard_script("0", 1));
        let mut scheduler = Scheduler::new(jobs_with(&pairs, &["mp4"]), 5, ctx).unwrap();
        let mut recorder = Recorder::default();

        let summary = timeout(WAIT, scheduler.run(&mut recorder)).await.unwrap();

        assert_eq!(recorder.started_running, 2);
        assert_eq!(recorder.started_queued, 0);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(fs::read_to_string(&pairs[0].1).unwrap(), "3");
        assert_eq!(fs::read_to_string(&pairs[1].1).unwrap(), "2");
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_the_queue() {
        let dir = TempDir::new().unwrap();
        let pairs = sources(dir.path(), 3);
        let mut jobs = jobs_with(&pairs, &["mp4"]);
        jobs[1].presets.push("crash".to_string());
        let ctx = script_context(dir.path(), &standard_script("0", 4));
        let mut scheduler = Scheduler::new(jobs, 1, ctx).unwrap();
        let mut recorder = Recorder::default();

        let summary = timeout(WAIT, scheduler.run(&mut recorder)).await.unwrap();

        assert_eq!(recorder.successes, vec![0, 2]);
        assert_eq!(recorder.failures, vec![(1, 4)]);
        assert_eq!(
            summary,
            RunSummary {
                succeeded: 2,
                failed: 1,
                faulted: 0,
                cancelled: 0
            }
        );
        assert!(!summary.is_success());
        assert!(!pairs[1].1.exists());
    }

    #[tokio::test]
    async fn test_fault_is_counted_separately() {
        let dir = TempDir::new().unwrap();
        let pairs = sources(dir.path(), 2);
        let script = r#"printf '  Duration: garbage\n' >&2
exit 0"#;
        let ctx = script_context(dir.path(), script);
        let mut scheduler = Scheduler::new(jobs_with(&pairs, &["mp3"]), 1, ctx).unwrap();
        let mut recorder = Recorder::default();

        let summary = timeout(WAIT, scheduler.run(&mut recorder)).await.unwrap();

        assert_eq!(summary.faulted, 2);
        assert_eq!(recorder.faults, 2);
        assert!(scheduler.runners().iter().all(|r| r.state() == RunnerState::Failed));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_and_queued() {
        let dir = TempDir::new().unwrap();
        let pairs = sources(dir.path(), 3);
        let script = r#"for last; do :; done
printf 'partial' > "$last"
exec sleep 30"#;
        let ctx = script_context(dir.path(), script);
        let mut scheduler = Scheduler::new(jobs_with(&pairs, &["mp4"]), 2, ctx).unwrap();
        let mut recorder = Recorder::default();

        let shutdown = tokio::time::sleep(Duration::from_millis(300));
        let summary = timeout(WAIT, scheduler.run_until(&mut recorder, shutdown))
            .await
            .unwrap();

        assert!(recorder.shutdown_seen);
        assert_eq!(summary.cancelled, 3);
        assert_eq!(summary.total(), 3);
        assert_eq!(scheduler.running_count(), 0);
        for (_, dest) in &pairs {
            assert!(!dest.exists());
        }
        assert_eq!(scheduler.runners()[2].state(), RunnerState::Idle);
        assert!(!scheduler.is_running(0));
    }

    #[tokio::test]
    async fn test_shutdown_keeps_outcomes_already_reported() {
        let dir = TempDir::new().unwrap();
        let fast = dir.path().join("fast.mov");
        let slow = dir.path().join("slow.mov");
        fs::write(&fast, "fast").unwrap();
        fs::write(&slow, "slow").unwrap();
        let script = r#"for last; do :; done
case "$4" in
  *slow*) exec sleep 30 ;;
esac
printf 'done' > "$last""#;
        let ctx = script_context(dir.path(), script);
        let jobs = vec![
            Job::new(&fast, dir.path().join("fast.mp4"), vec!["mp4".to_string()]),
            Job::new(&slow, dir.path().join("slow.mp4"), vec!["mp4".to_string()]),
        ];
        let mut scheduler = Scheduler::new(jobs, 2, ctx).unwrap();
        scheduler.start();

        // Let the fast job report success without the scheduler reading it
        let done = dir.path().join("fast.mp4");
        timeout(WAIT, async {
            while !done.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut recorder = Recorder::default();
        let summary = timeout(WAIT, scheduler.run_until(&mut recorder, std::future::ready(())))
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(recorder.successes, vec![0]);
        assert_eq!(scheduler.runners()[0].state(), RunnerState::Succeeded);
        assert_eq!(scheduler.runners()[1].state(), RunnerState::Cancelled);
        assert_eq!(fs::read_to_string(&done).unwrap(), "done");
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let pairs = sources(dir.path(), 3);
        let ctx = script_context(dir.path(), &standard_script("0", 1));
        let mut scheduler = Scheduler::new(jobs_with(&pairs, &["mp4"]), 2, ctx).unwrap();

        scheduler.start();
        scheduler.start();
        assert_eq!(scheduler.running_count(), 2);
        assert_eq!(scheduler.queued(), 1);
        assert_eq!(scheduler.threads_in_use(), 2);
        assert!(scheduler.is_running(0) && scheduler.is_running(1));

        let summary = timeout(WAIT, scheduler.run(&mut ())).await.unwrap();
        assert_eq!(summary.succeeded, 3);
    }
}
