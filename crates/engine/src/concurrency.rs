//! Concurrency planning module for fconv
//!
//! Decides how a thread budget is split between jobs: how many run at once
//! and how many threads each one is started with.

use fconv_config::ThreadConfig;

/// Admission plan derived from the job count and the thread budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// More jobs than threads: `slots` jobs run at a time with one thread
    /// each, and every completion admits the next queued job.
    Saturate { slots: usize },
    /// No more jobs than threads: every job starts at once with the listed
    /// allocation (queue order) and nothing is admitted later.
    Partition { allocations: Vec<u32> },
}

impl Admission {
    /// Plan admission for `job_count` jobs sharing `budget` threads.
    ///
    /// Uses the following rules:
    /// - `job_count > budget`: `budget` jobs with 1 thread each, refilled on completion
    /// - `job_count <= budget`: all jobs, `budget / job_count` threads each, the
    ///   first job also receiving the remainder
    /// - no jobs: an empty partition
    pub fn plan(job_count: usize, budget: u32) -> Self {
        let budget_slots = budget as usize;

        if job_count > budget_slots {
            return Admission::Saturate {
                slots: budget_slots,
            };
        }

        if job_count == 0 {
            return Admission::Partition {
                allocations: Vec::new(),
            };
        }

        // job_count <= budget here, so the cast cannot truncate
        let jobs = job_count as u32;
        let threads = budget / jobs;
        let remainder = budget - threads * jobs;

        let allocations = (0..job_count)
            .map(|i| if i == 0 { threads + remainder } else { threads })
            .collect();

        Admission::Partition { allocations }
    }

    /// Thread counts for the jobs started immediately, in queue order
    pub fn initial_allocations(&self) -> Vec<u32> {
        match self {
            Admission::Saturate { slots } => vec![1; *slots],
            Admission::Partition { allocations } => allocations.clone(),
        }
    }

    /// Whether completions admit further queued jobs
    pub fn refills(&self) -> bool {
        matches!(self, Admission::Saturate { .. })
    }

    /// Threads given to jobs admitted after a completion
    pub fn refill_threads(&self) -> u32 {
        1
    }
}

/// Default thread budget: every logical core but one, and at least one
pub fn default_thread_budget() -> u32 {
    (num_cpus::get() as u32).saturating_sub(1).max(1)
}

/// Thread budget from configuration, falling back to auto-detection
pub fn resolve_budget(cfg: &ThreadConfig) -> u32 {
    cfg.budget
        .filter(|&budget| budget > 0)
        .unwrap_or_else(default_thread_budget)
}
