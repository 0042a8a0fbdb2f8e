//! Parallel execution of expanded task sets.
//!
//! Tasks run on a bounded rayon pool. Results are collected by task index,
//! so their order never depends on scheduling. A diverging task is recorded
//! in place and its siblings continue; a cancelled run keeps everything that
//! finished and marks the rest as cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};

use crate::error::PbpkError;
use crate::scenario::SimulationTask;
use crate::simulator::{simulate, SimulationResult, SolverOptions, TaskStatus};

/// Run-level cooperative cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Worker threads
    pub concurrency: usize,
    /// Show a progress bar on stderr
    pub progress: bool,
    pub solver: SolverOptions,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            progress: false,
            solver: SolverOptions::default(),
        }
    }
}

impl ScanOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }
}

fn progress_bar(total: usize) -> ProgressBar {
    let bar = ProgressBar::new(total as u64);
    if let Ok(style) =
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} tasks (ETA {eta})")
    {
        bar.set_style(style);
    }
    bar
}

fn run_task(
    task: &SimulationTask,
    options: &ScanOptions,
    cancel: &CancellationToken,
) -> SimulationResult {
    if cancel.is_cancelled() {
        return SimulationResult::failed(task, TaskStatus::Cancelled);
    }
    match simulate(task, &options.solver, Some(cancel)) {
        Ok(result) => result,
        Err(error) => {
            if !matches!(error, PbpkError::CancellationRequested) {
                tracing::warn!(
                    task = task.identity().index,
                    scenario = %task.identity().scenario,
                    %error,
                    "task failed"
                );
            }
            SimulationResult::failed(task, TaskStatus::from_error(&error))
        }
    }
}

/// Run every task, returning one result per task in task order
pub fn run_scan(
    tasks: &[SimulationTask],
    options: &ScanOptions,
    cancel: &CancellationToken,
) -> Result<Vec<SimulationResult>, PbpkError> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(options.concurrency.max(1))
        .build()
        .map_err(|e| PbpkError::ThreadPool(e.to_string()))?;
    let bar = options.progress.then(|| progress_bar(tasks.len()));

    tracing::info!(
        tasks = tasks.len(),
        concurrency = options.concurrency.max(1),
        "starting scan"
    );
    let results: Vec<SimulationResult> = pool.install(|| {
        tasks
            .par_iter()
            .map(|task| {
                let result = run_task(task, options, cancel);
                if let Some(bar) = &bar {
                    bar.inc(1);
                }
                result
            })
            .collect()
    });
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    let completed = results.iter().filter(|r| r.is_completed()).count();
    let cancelled = results
        .iter()
        .filter(|r| *r.status() == TaskStatus::Cancelled)
        .count();
    tracing::info!(
        completed,
        failed = results.len() - completed - cancelled,
        cancelled,
        "scan finished"
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompartmentalModel, ModelDefinition};
    use crate::scenario::{expand, DoseEvent, Scenario, Timepoints};

    fn tasks() -> Vec<SimulationTask> {
        let def: ModelDefinition = serde_json::from_str(
            r#"{
                "id": "decay",
                "compartments": [{"id": "V", "size": 1.0}],
                "species": [{"id": "A", "compartment": "V", "amountOnly": true}],
                "parameters": [{"id": "k", "value": 0.1, "unit": "1/min"}],
                "reactions": [{"id": "elim", "equation": "A ->", "rate": "sqrt(k) * sqrt(k) * A"}],
                "routes": [{"id": "iv", "target": "A"}]
            }"#,
        )
        .unwrap();
        let model = Arc::new(CompartmentalModel::new(def).unwrap());
        let scenario = Scenario::new("s", Timepoints::List(vec![0.0, 1.0, 2.0]))
            .with_dose(
                "iv",
                vec![DoseEvent {
                    route: "iv".into(),
                    amount: 1.0,
                    time: 0.0,
                    repeat: None,
                }],
            )
            .with_override("k", vec![0.1, 0.2, -1.0, 0.4]);
        expand(&scenario, &model).unwrap()
    }

    #[test]
    fn test_failure_is_recorded_in_place() {
        let tasks = tasks();
        let options = ScanOptions::default().with_concurrency(2);
        let results = run_scan(&tasks, &options, &CancellationToken::new()).unwrap();
        assert_eq!(results.len(), 4);
        let statuses: Vec<&str> = results.iter().map(|r| r.status().label()).collect();
        assert_eq!(statuses, vec!["completed", "completed", "diverged", "completed"]);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.identity().index, i);
        }
    }

    #[test]
    fn test_cancelled_run_marks_every_task() {
        let tasks = tasks();
        let token = CancellationToken::new();
        token.cancel();
        let results = run_scan(&tasks, &ScanOptions::default(), &token).unwrap();
        assert_eq!(results.len(), tasks.len());
        assert!(results.iter().all(|r| *r.status() == TaskStatus::Cancelled));
    }
}
