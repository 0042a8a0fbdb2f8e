use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::PbpkError;
use crate::scenario::{SimulationTask, TaskIdentity};

/// Outcome of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Diverged { time: f64, reason: String },
    Cancelled,
}

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Completed => "completed",
            TaskStatus::Diverged { .. } => "diverged",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Status recorded for a task that failed with `error`
    pub fn from_error(error: &PbpkError) -> Self {
        match error {
            PbpkError::CancellationRequested => TaskStatus::Cancelled,
            PbpkError::IntegrationDivergedError { time, reason } => TaskStatus::Diverged {
                time: *time,
                reason: reason.clone(),
            },
            other => TaskStatus::Diverged {
                time: f64::NAN,
                reason: other.to_string(),
            },
        }
    }
}

/// A sample that went negative beyond the tolerance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverWarning {
    pub time: f64,
    pub state: String,
    pub value: f64,
}

/// Sampled trajectory of one task.
///
/// `states` and `outputs` hold one row per sampled time. Failed and
/// cancelled tasks keep their identity and status but carry no samples.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    identity: TaskIdentity,
    status: TaskStatus,
    times: Vec<f64>,
    state_names: Vec<String>,
    states: Array2<f64>,
    output_names: Vec<String>,
    outputs: Array2<f64>,
    warnings: Vec<SolverWarning>,
    total_dose: f64,
    dosed_states: Vec<String>,
    steps: usize,
}

impl SimulationResult {
    pub(crate) fn completed(
        task: &SimulationTask,
        times: Vec<f64>,
        states: Vec<Vec<f64>>,
        outputs: Vec<Vec<f64>>,
        warnings: Vec<SolverWarning>,
        steps: usize,
    ) -> Self {
        let model = task.model();
        let nstates = model.nstates();
        let nout = model.output_names().len();
        let rows = times.len();
        Self {
            identity: task.identity().clone(),
            status: TaskStatus::Completed,
            times,
            state_names: model.state_names(),
            states: Array2::from_shape_fn((rows, nstates), |(i, j)| states[i][j]),
            output_names: model.output_names(),
            outputs: Array2::from_shape_fn((rows, nout), |(i, j)| outputs[i][j]),
            warnings,
            total_dose: task.total_dose(),
            dosed_states: task.dosed_states(),
            steps,
        }
    }

    /// A result without samples
    pub fn failed(task: &SimulationTask, status: TaskStatus) -> Self {
        let model = task.model();
        Self {
            identity: task.identity().clone(),
            status,
            times: Vec::new(),
            state_names: model.state_names(),
            states: Array2::zeros((0, model.nstates())),
            output_names: model.output_names(),
            outputs: Array2::zeros((0, model.output_names().len())),
            warnings: Vec::new(),
            total_dose: task.total_dose(),
            dosed_states: task.dosed_states(),
            steps: 0,
        }
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn state_names(&self) -> &[String] {
        &self.state_names
    }

    pub fn states(&self) -> &Array2<f64> {
        &self.states
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    pub fn outputs(&self) -> &Array2<f64> {
        &self.outputs
    }

    pub fn warnings(&self) -> &[SolverWarning] {
        &self.warnings
    }

    /// Dose applied within the sampled horizon, in model units
    pub fn total_dose(&self) -> f64 {
        self.total_dose
    }

    /// States that received a dose
    pub fn dosed_states(&self) -> &[String] {
        &self.dosed_states
    }

    /// Accepted solver steps over all segments
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Sampled series of an output or, failing that, a state
    pub fn series(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        if let Some(j) = self.output_names.iter().position(|n| n == name) {
            return Some(self.outputs.column(j));
        }
        self.state_names
            .iter()
            .position(|n| n == name)
            .map(|j| self.states.column(j))
    }
}
