//! Running the analyses of a bundle.
//!
//! Each selected analysis is composed, expanded, scanned and aggregated in
//! turn; its artifacts go to `<output_dir>/<analysis>/`. Structural errors
//! abort the run. Task failures only show up in the report.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::aggregate::{aggregate, AggregateOptions, ResultTable};
use crate::bundle::Bundle;
use crate::error::PbpkError;
use crate::scan::{run_scan, CancellationToken, ScanOptions};
use crate::scenario::expand;
use crate::simulator::TaskStatus;

/// Which analyses of a bundle to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    /// A group or a single analysis
    Name(String),
}

impl From<&str> for Selector {
    fn from(value: &str) -> Self {
        match value {
            "all" => Selector::All,
            name => Selector::Name(name.to_string()),
        }
    }
}

impl Selector {
    /// Resolve to analysis names; groups win over analyses of the same name
    pub fn resolve(&self, bundle: &Bundle) -> Result<Vec<String>, PbpkError> {
        match self {
            Selector::All => Ok(bundle
                .analysis_names()
                .into_iter()
                .map(String::from)
                .collect()),
            Selector::Name(name) => {
                if let Some(members) = bundle.group(name) {
                    Ok(members.to_vec())
                } else if bundle.manifest().analyses.contains_key(name) {
                    Ok(vec![name.clone()])
                } else {
                    Err(PbpkError::scenario(
                        name,
                        format!("no analysis or group '{}' in bundle '{}'", name, bundle.id()),
                    ))
                }
            }
        }
    }
}

/// Everything that shapes a run besides the bundle itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub scan: ScanOptions,
    pub aggregate: AggregateOptions,
}

impl RunOptions {
    pub fn with_scan(mut self, scan: ScanOptions) -> Self {
        self.scan = scan;
        self
    }

    pub fn with_aggregate(mut self, aggregate: AggregateOptions) -> Self {
        self.aggregate = aggregate;
        self
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PbpkError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| PbpkError::io(path, e))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Outcome of one analysis
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub name: String,
    pub output_dir: PathBuf,
    pub tasks: usize,
    pub completed: usize,
    pub diverged: usize,
    pub cancelled: usize,
    pub table: ResultTable,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub analyses: Vec<AnalysisReport>,
}

impl RunReport {
    /// Whether every task of every analysis completed
    pub fn success(&self) -> bool {
        self.analyses.iter().all(|a| a.completed == a.tasks)
    }

    /// Process exit status: 0 on full success, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }
}

fn run_analysis(
    bundle: &Bundle,
    name: &str,
    output_dir: &Path,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<AnalysisReport, PbpkError> {
    let model = Arc::new(bundle.model(name)?);
    let scenario = bundle.scenario(name)?;
    let tasks = expand(&scenario, &model)?;
    let results = run_scan(&tasks, &options.scan, cancel)?;
    let mut aggregate_options = options.aggregate.clone();
    if aggregate_options.dosed_observables.is_empty() {
        aggregate_options.dosed_observables = bundle.manifest().dosed_observables.clone();
    }
    let table = aggregate(&results, &aggregate_options)?;

    let dir = output_dir.join(name);
    table.write_all(&dir)?;

    let count = |f: fn(&TaskStatus) -> bool| results.iter().filter(|r| f(r.status())).count();
    Ok(AnalysisReport {
        name: name.to_string(),
        output_dir: dir,
        tasks: results.len(),
        completed: count(|s| matches!(s, TaskStatus::Completed)),
        diverged: count(|s| matches!(s, TaskStatus::Diverged { .. })),
        cancelled: count(|s| matches!(s, TaskStatus::Cancelled)),
        table,
    })
}

/// Run the selected analyses of `bundle`, writing results below `output_dir`
pub fn run_analyses(
    bundle: &Bundle,
    selector: &Selector,
    output_dir: impl AsRef<Path>,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<RunReport, PbpkError> {
    let output_dir = output_dir.as_ref();
    let names = selector.resolve(bundle)?;
    let mut report = RunReport::default();
    for name in &names {
        tracing::info!(bundle = %bundle.id(), analysis = %name, "running analysis");
        let analysis = run_analysis(bundle, name, output_dir, options, cancel)?;
        if analysis.completed < analysis.tasks {
            tracing::warn!(
                analysis = %name,
                diverged = analysis.diverged,
                cancelled = analysis.cancelled,
                "analysis finished with incomplete tasks"
            );
        }
        report.analyses.push(analysis);
    }
    Ok(report)
}
