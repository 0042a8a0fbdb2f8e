use std::fs;
use std::io::Write;
use std::path::Path;

use csv::WriterBuilder;
use ndarray::{concatenate, Array2, Axis};
use serde::{Deserialize, Serialize};

use super::PkSummary;
use crate::error::PbpkError;
use crate::scenario::TaskIdentity;
use crate::simulator::{SimulationResult, TaskStatus};

const MISSING: &str = ".";

/// One summary line: a task and one of its observables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub task: TaskIdentity,
    pub status: TaskStatus,
    pub observable: Option<String>,
    pub pk: Option<PkSummary>,
}

/// Sampled trajectory of one task, states followed by outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: TaskIdentity,
    pub status: TaskStatus,
    pub total_dose: f64,
    pub warnings: usize,
    pub steps: usize,
    pub times: Vec<f64>,
    pub columns: Vec<String>,
    pub samples: Array2<f64>,
}

impl TaskRecord {
    pub fn from_result(result: &SimulationResult) -> Self {
        let columns = result
            .state_names()
            .iter()
            .chain(result.output_names())
            .cloned()
            .collect();
        let samples = concatenate(Axis(1), &[result.states().view(), result.outputs().view()])
            .unwrap_or_else(|_| result.states().clone());
        Self {
            task: result.identity().clone(),
            status: result.status().clone(),
            total_dose: result.total_dose(),
            warnings: result.warnings().len(),
            steps: result.steps(),
            times: result.times().to_vec(),
            columns,
            samples,
        }
    }
}

/// Aggregated output of one scan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    rows: Vec<SummaryRow>,
    tasks: Vec<TaskRecord>,
}

fn fmt(value: Option<f64>) -> String {
    value.map_or(MISSING.to_string(), |v| v.to_string())
}

fn overrides(task: &TaskIdentity) -> String {
    task.overrides
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(";")
}

fn task_fields(task: &TaskIdentity, status: &TaskStatus) -> Vec<String> {
    vec![
        task.index.to_string(),
        task.scenario.clone(),
        task.dose_label.clone(),
        task.combination.to_string(),
        task.repetition.to_string(),
        overrides(task),
        status.label().to_string(),
    ]
}

const TASK_HEADER: [&str; 7] = [
    "task",
    "scenario",
    "dose",
    "combination",
    "repetition",
    "overrides",
    "status",
];

impl ResultTable {
    pub(crate) fn push_row(&mut self, row: SummaryRow) {
        self.rows.push(row);
    }

    pub(crate) fn push_record(&mut self, record: TaskRecord) -> Result<(), PbpkError> {
        if let Some(first) = self.tasks.first() {
            if first.columns != record.columns {
                return Err(PbpkError::scenario(
                    &record.task.scenario,
                    "tasks of one table must share their state and output columns",
                ));
            }
        }
        self.tasks.push(record);
        Ok(())
    }

    pub fn rows(&self) -> &[SummaryRow] {
        &self.rows
    }

    pub fn tasks(&self) -> &[TaskRecord] {
        &self.tasks
    }

    /// Summary rows of one task
    pub fn rows_of(&self, task: usize) -> impl Iterator<Item = &SummaryRow> {
        self.rows.iter().filter(move |r| r.task.index == task)
    }

    /// One line per task per sampled time
    pub fn write_timecourses(&self, path: impl AsRef<Path>) -> Result<(), PbpkError> {
        let mut writer = WriterBuilder::new().has_headers(true).from_path(path)?;
        let columns = self.tasks.first().map(|t| t.columns.as_slice()).unwrap_or(&[]);
        let mut header: Vec<&str> = TASK_HEADER.to_vec();
        header.push("time");
        header.extend(columns.iter().map(String::as_str));
        writer.write_record(&header)?;

        for record in &self.tasks {
            for (i, t) in record.times.iter().enumerate() {
                let mut line = task_fields(&record.task, &record.status);
                line.push(t.to_string());
                line.extend(record.samples.row(i).iter().map(|v| v.to_string()));
                writer.write_record(&line)?;
            }
        }
        writer.flush().map_err(|e| PbpkError::Csv(e.into()))?;
        Ok(())
    }

    /// One line per task per observable
    pub fn write_summary(&self, path: impl AsRef<Path>) -> Result<(), PbpkError> {
        let mut writer = WriterBuilder::new().has_headers(true).from_path(path)?;
        let mut header: Vec<&str> = TASK_HEADER.to_vec();
        header.extend([
            "reason", "observable", "total_dose", "cmax", "tmax", "clast", "tlast", "auc", "aucinf",
            "kel", "thalf", "cl", "vd",
        ]);
        writer.write_record(&header)?;

        for row in &self.rows {
            let mut line = task_fields(&row.task, &row.status);
            line.push(match &row.status {
                TaskStatus::Diverged { time, reason } => format!("t={}: {}", time, reason),
                _ => MISSING.to_string(),
            });
            line.push(row.observable.clone().unwrap_or_else(|| MISSING.to_string()));
            let dose = self
                .tasks
                .iter()
                .find(|t| t.task.index == row.task.index)
                .map(|t| t.total_dose);
            line.push(fmt(dose));
            match &row.pk {
                Some(pk) => line.extend([
                    fmt(Some(pk.cmax)),
                    fmt(Some(pk.tmax)),
                    fmt(Some(pk.clast)),
                    fmt(Some(pk.tlast)),
                    fmt(Some(pk.auc)),
                    fmt(pk.aucinf),
                    fmt(pk.kel),
                    fmt(pk.thalf),
                    fmt(pk.cl),
                    fmt(pk.vd),
                ]),
                None => line.extend(vec![MISSING.to_string(); 10]),
            }
            writer.write_record(&line)?;
        }
        writer.flush().map_err(|e| PbpkError::Csv(e.into()))?;
        Ok(())
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), PbpkError> {
        let path = path.as_ref();
        let file = fs::File::create(path).map_err(|e| PbpkError::io(path, e))?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush().map_err(|e| PbpkError::io(path, e))?;
        Ok(())
    }

    /// Write `timecourses.csv`, `summary.csv` and `results.json` into `dir`
    pub fn write_all(&self, dir: impl AsRef<Path>) -> Result<(), PbpkError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| PbpkError::io(dir, e))?;
        self.write_timecourses(dir.join("timecourses.csv"))?;
        self.write_summary(dir.join("summary.csv"))?;
        self.write_json(dir.join("results.json"))?;
        tracing::info!(dir = %dir.display(), rows = self.rows.len(), "wrote results");
        Ok(())
    }
}
