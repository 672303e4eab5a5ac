use crossbeam_queue::SegQueue;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backend::Engine;
use crate::command::{DEFAULT_ENGINE, Platform, max_parallelism};
use crate::plan::{DEFAULT_THREAD_COUNT, WorkItem};
use crate::types::Totals;
use crate::work::{CompletedWork, WorkContext, execute};
use crate::{t, t_args};

/// Datasources whose remaining items must not invoke the engine.
#[derive(Debug, Default)]
pub struct AbortRegistry {
    aborted: Mutex<HashSet<String>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self, datasource: &str) {
        let mut set = self.aborted.lock().unwrap_or_else(|e| e.into_inner());
        if set.insert(datasource.to_string()) {
            warn!("{}", t_args!("abort-datasource", "ds" => datasource));
        }
    }

    pub fn is_aborted(&self, datasource: &str) -> bool {
        self.aborted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(datasource)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_workers: usize,
    /// Halt the run when no smoke test exists or any of them fails.
    pub require_smoke_test: bool,
    /// Run every datasource in the second phase even if its smoke tests failed.
    pub force_run: bool,
    /// Stop after the smoke test phase.
    pub smoke_only: bool,
    pub engine_path: String,
    pub platform: Platform,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_THREAD_COUNT,
            require_smoke_test: false,
            force_run: false,
            smoke_only: false,
            engine_path: DEFAULT_ENGINE.to_string(),
            platform: Platform::current(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PhaseReport {
    pub totals: Totals,
    pub elapsed: Duration,
    pub workers: usize,
    /// Completed items in queue order.
    pub completed: Vec<CompletedWork>,
}

impl PhaseReport {
    fn new(completed: Vec<CompletedWork>, elapsed: Duration, workers: usize) -> Self {
        let mut totals = Totals::default();
        for work in &completed {
            for r in &work.results {
                totals.record(r);
            }
        }
        Self { totals, elapsed, workers, completed }
    }

    pub fn failing_datasources(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for work in self.completed.iter().filter(|w| w.failed()) {
            let ds = work.item.datasource();
            if !out.iter().any(|d| d == ds) {
                out.push(ds.to_string());
            }
        }
        out
    }
}

/// Why a run stopped before the main phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    SmokeTestFailed,
    NoSmokeTests,
    SmokeOnly,
    NothingToRun,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub smoke: PhaseReport,
    pub main: PhaseReport,
    pub halted: Option<Halt>,
    pub failing_datasources: Vec<String>,
}

impl RunReport {
    pub fn totals(&self) -> Totals {
        let mut totals = self.smoke.totals;
        totals += self.main.totals;
        totals
    }

    pub fn completed(&self) -> impl Iterator<Item = &CompletedWork> {
        self.smoke.completed.iter().chain(self.main.completed.iter())
    }

    pub fn into_completed(self) -> Vec<CompletedWork> {
        let mut all = self.smoke.completed;
        all.extend(self.main.completed);
        all
    }
}

pub struct Scheduler {
    pub options: SchedulerOptions,
    aborts: AbortRegistry,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Self {
            options,
            aborts: AbortRegistry::new(),
        }
    }

    pub fn aborts(&self) -> &AbortRegistry {
        &self.aborts
    }

    /// Runs smoke tests first, then everything else.
    pub fn run(&self, items: Vec<WorkItem>, engine: &dyn Engine) -> RunReport {
        let mut report = RunReport::default();
        if items.is_empty() {
            report.halted = Some(Halt::NothingToRun);
            return report;
        }

        let (smoke, mut rest): (Vec<_>, Vec<_>) = items.into_iter().partition(WorkItem::is_smoke_test);

        if smoke.is_empty() && self.options.require_smoke_test {
            warn!("{}", t!("smoke-none"));
            report.halted = Some(Halt::NoSmokeTests);
            return report;
        }

        if !smoke.is_empty() {
            info!("{}", t_args!("phase-start", "phase" => "smoke", "count" => smoke.len()));
            report.smoke = self.run_phase(smoke, engine);
            report.failing_datasources = report.smoke.failing_datasources();
        }

        if !report.failing_datasources.is_empty() {
            warn!(
                "{}",
                t_args!("smoke-failed", "ds" => report.failing_datasources.join(", "))
            );
            if self.options.require_smoke_test {
                report.halted = Some(Halt::SmokeTestFailed);
                return report;
            }
            if !self.options.force_run {
                for item in rest.iter_mut() {
                    if report.failing_datasources.iter().any(|d| d == item.datasource()) {
                        item.mark_skipped();
                    }
                }
            }
        }

        if self.options.smoke_only {
            report.halted = Some(Halt::SmokeOnly);
            return report;
        }

        if !rest.is_empty() {
            info!("{}", t_args!("phase-start", "phase" => "main", "count" => rest.len()));
            report.main = self.run_phase(rest, engine);
        }
        report
    }

    /// Drains one FIFO queue with a bounded set of scoped workers.
    pub fn run_phase(&self, items: Vec<WorkItem>, engine: &dyn Engine) -> PhaseReport {
        let start = Instant::now();
        let count = items.len();
        // an item's own thread count caps the pool it runs in
        let desired = items
            .iter()
            .map(|i| i.invocation.thread_count)
            .filter(|&n| n > 0)
            .min()
            .map_or(self.options.max_workers, |n| n.min(self.options.max_workers));
        let workers = max_parallelism(desired, self.options.platform, &self.options.engine_path)
            .min(count)
            .max(1);

        let queue: SegQueue<(usize, WorkItem)> = SegQueue::new();
        for entry in items.into_iter().enumerate() {
            queue.push(entry);
        }

        let (tx, rx) = mpsc::channel::<(usize, CompletedWork)>();
        thread::scope(|s| {
            for thread_id in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let ctx = WorkContext {
                    engine_path: &self.options.engine_path,
                    platform: self.options.platform,
                    aborts: &self.aborts,
                    thread_id,
                };
                s.spawn(move || {
                    while let Some((index, item)) = queue.pop() {
                        debug!("[{}] starting {}", thread_id, item.test_set.config_name);
                        let done = execute(item, engine, &ctx);
                        debug!(
                            "[{}] finished {} in {:.1}s",
                            thread_id,
                            done.item.test_set.config_name,
                            done.elapsed.as_secs_f64()
                        );
                        if tx.send((index, done)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        let mut completed: Vec<(usize, CompletedWork)> = rx.into_iter().collect();
        completed.sort_by_key(|(index, _)| *index);
        let completed = completed.into_iter().map(|(_, w)| w).collect();
        PhaseReport::new(completed, start.elapsed(), workers)
    }
}
