//! Integration of single tasks.
//!
//! A task's horizon is split at its dosing times. Each continuous segment is
//! solved by a fresh BDF problem started from the carried state, and the
//! requested timepoints are sampled from the solver's dense output. A sample
//! taken exactly at a dosing time reflects the state after the dose.

mod problem;
pub mod result;

use std::time::Instant;

use diffsol::{ode_solver::method::OdeSolverMethod, OdeBuilder, OdeSolverStopReason};
use serde::{Deserialize, Serialize};

use crate::error::PbpkError;
use crate::scan::CancellationToken;
use crate::scenario::SimulationTask;
use problem::SegmentProblem;
pub use result::{SimulationResult, SolverWarning, TaskStatus};

type M = nalgebra::DMatrix<f64>;

/// Numerical settings of the integrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub rtol: f64,
    pub atol: f64,
    /// Initial step size
    pub h0: f64,
    /// Accepted steps allowed per task, over all segments
    pub max_steps: usize,
    /// Wall-clock budget per task in seconds
    pub max_wall_time: Option<f64>,
    /// Negative values of non-negative states down to this size are set to zero
    pub negative_tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-9,
            h0: 1e-3,
            max_steps: 100_000,
            max_wall_time: None,
            negative_tolerance: 1e-9,
        }
    }
}

impl SolverOptions {
    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_wall_time(mut self, seconds: f64) -> Self {
        self.max_wall_time = Some(seconds);
        self
    }

    pub fn with_negative_tolerance(mut self, tolerance: f64) -> Self {
        self.negative_tolerance = tolerance;
        self
    }
}

/// Samples collected while a task advances
struct Recorder<'a> {
    task: &'a SimulationTask,
    options: &'a SolverOptions,
    nonnegative: Vec<bool>,
    times: Vec<f64>,
    states: Vec<Vec<f64>>,
    outputs: Vec<Vec<f64>>,
    warnings: Vec<SolverWarning>,
}

impl<'a> Recorder<'a> {
    fn new(task: &'a SimulationTask, options: &'a SolverOptions) -> Self {
        let n = task.timepoints().len();
        Self {
            task,
            options,
            nonnegative: task.model().nonnegative_mask(),
            times: Vec::with_capacity(n),
            states: Vec::with_capacity(n),
            outputs: Vec::with_capacity(n),
            warnings: Vec::new(),
        }
    }

    fn next_time(&self) -> Option<f64> {
        self.task.timepoints().get(self.times.len()).copied()
    }

    fn done(&self) -> bool {
        self.times.len() == self.task.timepoints().len()
    }

    /// Zero small negative excursions; larger ones are kept and reported
    fn clamp(&mut self, t: f64, state: &mut [f64]) {
        let tol = self.options.negative_tolerance;
        for (i, value) in state.iter_mut().enumerate() {
            if !self.nonnegative[i] || *value >= 0.0 {
                continue;
            }
            if *value >= -tol {
                *value = 0.0;
                continue;
            }
            let id = &self.task.model().states()[i].id;
            // a segment boundary clamps the carried state and then records it
            let reported = self
                .warnings
                .iter()
                .rev()
                .take_while(|w| w.time == t)
                .any(|w| &w.state == id);
            if !reported {
                self.warnings.push(SolverWarning {
                    time: t,
                    state: id.clone(),
                    value: *value,
                });
            }
        }
    }

    fn record(&mut self, t: f64, mut state: Vec<f64>) {
        self.clamp(t, &mut state);
        let outputs = self
            .task
            .model()
            .evaluate_outputs(t, &state, self.task.parameters());
        self.times.push(t);
        self.states.push(state);
        self.outputs.push(outputs);
    }
}

fn diverged(time: f64, err: impl std::fmt::Display) -> PbpkError {
    PbpkError::diverged(time, err.to_string())
}

/// Budget shared by all segments of a task
struct Budget {
    steps: usize,
    max_steps: usize,
    started: Instant,
    max_wall_time: Option<f64>,
}

impl Budget {
    fn step(&mut self, t: f64) -> Result<(), PbpkError> {
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(diverged(
                t,
                format!("exceeded {} solver steps", self.max_steps),
            ));
        }
        if let Some(limit) = self.max_wall_time {
            if self.started.elapsed().as_secs_f64() > limit {
                return Err(diverged(t, format!("exceeded wall time of {} s", limit)));
            }
        }
        Ok(())
    }
}

/// Integrate one continuous segment from `t0` to `t1`, recording every
/// requested time strictly inside it, and return the state at `t1`
fn integrate_segment(
    task: &SimulationTask,
    options: &SolverOptions,
    t0: f64,
    t1: f64,
    state: &[f64],
    recorder: &mut Recorder,
    budget: &mut Budget,
) -> Result<Vec<f64>, PbpkError> {
    let model = task.model();
    let p = task.parameters();

    let dx = model.derivatives(t0, state, p);
    if let Some(i) = dx.iter().position(|d| !d.is_finite()) {
        return Err(diverged(
            t0,
            format!("non-finite derivative of '{}'", model.states()[i].id),
        ));
    }

    let problem = OdeBuilder::<M>::new()
        .atol(vec![options.atol; model.nstates()])
        .rtol(options.rtol)
        .t0(t0)
        .h0(options.h0)
        .p(p.to_vec())
        .build_from_eqn(SegmentProblem::new(model.clone(), p.to_vec(), state))
        .map_err(|e| diverged(t0, e))?;
    let mut solver = problem
        .bdf::<diffsol::NalgebraLU<f64>>()
        .map_err(|e| diverged(t0, e))?;
    solver.set_stop_time(t1).map_err(|e| diverged(t0, e))?;

    loop {
        let reason = solver.step().map_err(|e| diverged(solver.state().t, e))?;
        let t = solver.state().t;
        budget.step(t)?;
        if solver.state().y.iter().any(|v| !v.is_finite()) {
            return Err(diverged(t, "state became non-finite"));
        }
        while let Some(tp) = recorder.next_time() {
            if tp >= t1 || tp > t {
                break;
            }
            let y = solver.interpolate(tp).map_err(|e| diverged(tp, e))?;
            recorder.record(tp, y.as_slice().to_vec());
        }
        if let OdeSolverStopReason::TstopReached = reason {
            break;
        }
    }
    Ok(solver.state().y.as_slice().to_vec())
}

/// Integrate a task over its timepoints
///
/// Cancellation is observed between segments. Divergence, exhausted step
/// or wall-time budgets and non-finite states yield
/// [`PbpkError::IntegrationDivergedError`].
pub fn simulate(
    task: &SimulationTask,
    options: &SolverOptions,
    cancel: Option<&CancellationToken>,
) -> Result<SimulationResult, PbpkError> {
    let events = task.events();
    let Some(&t_end) = task.timepoints().last() else {
        return Ok(SimulationResult::completed(
            task,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            0,
        ));
    };

    let mut recorder = Recorder::new(task, options);
    let mut budget = Budget {
        steps: 0,
        max_steps: options.max_steps,
        started: Instant::now(),
        max_wall_time: options.max_wall_time,
    };
    let mut state = task.initial_state().to_vec();
    let mut t = task.t0();
    let mut next_event = 0;

    loop {
        while let Some(event) = events.get(next_event).filter(|e| e.time <= t) {
            state[event.state] += event.delta;
            next_event += 1;
        }
        recorder.clamp(t, &mut state);
        while let Some(tp) = recorder.next_time().filter(|tp| *tp <= t) {
            recorder.record(tp, state.clone());
        }
        if recorder.done() {
            break;
        }
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(PbpkError::CancellationRequested);
        }

        let t_next = events
            .get(next_event)
            .map_or(t_end, |e| e.time.min(t_end));
        state = integrate_segment(task, options, t, t_next, &state, &mut recorder, &mut budget)?;
        t = t_next;
    }

    if !recorder.warnings.is_empty() {
        tracing::warn!(
            task = task.identity().index,
            count = recorder.warnings.len(),
            "negative excursions beyond tolerance"
        );
    }
    let Recorder {
        times,
        states,
        outputs,
        warnings,
        ..
    } = recorder;
    Ok(SimulationResult::completed(
        task,
        times,
        states,
        outputs,
        warnings,
        budget.steps,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompartmentalModel, ModelDefinition};
    use crate::scenario::{expand, DoseEvent, Scenario, Timepoints};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn decay(k: f64) -> Arc<CompartmentalModel> {
        let def: ModelDefinition = serde_json::from_str(&format!(
            r#"{{
                "id": "decay",
                "compartments": [{{"id": "V", "size": 2.0}}],
                "species": [{{"id": "A", "compartment": "V", "initialAmount": 0.0, "amountOnly": true}}],
                "parameters": [{{"id": "k", "value": {k}, "unit": "1/min"}}],
                "reactions": [{{"id": "elim", "equation": "A ->", "rate": "k * A"}}],
                "routes": [{{"id": "iv", "target": "A"}}],
                "outputs": ["A"]
            }}"#
        ))
        .unwrap();
        Arc::new(CompartmentalModel::new(def).unwrap())
    }

    fn bolus(time: f64, amount: f64) -> DoseEvent {
        DoseEvent {
            route: "iv".into(),
            amount,
            time,
            repeat: None,
        }
    }

    #[test]
    fn test_first_order_decay_matches_analytical() {
        let k = 0.2;
        let scenario = Scenario::new(
            "s",
            Timepoints::Grid {
                start: 0.0,
                end: 20.0,
                steps: 20,
            },
        )
        .with_dose("iv", vec![bolus(0.0, 10.0)]);
        let tasks = expand(&scenario, &decay(k)).unwrap();
        let result = simulate(&tasks[0], &SolverOptions::default(), None).unwrap();
        assert_eq!(result.times().len(), 21);
        for (i, t) in result.times().iter().enumerate() {
            assert_relative_eq!(
                result.states()[[i, 0]],
                10.0 * (-k * t).exp(),
                max_relative = 1e-4
            );
        }
        // dose sampled post-jump
        assert_relative_eq!(result.states()[[0, 0]], 10.0);
    }

    #[test]
    fn test_repeated_dose_superposition() {
        let k = 0.1;
        let scenario = Scenario::new("s", Timepoints::List(vec![0.0, 5.0, 10.0, 15.0]))
            .with_dose("two", vec![bolus(0.0, 1.0), bolus(10.0, 1.0)]);
        let tasks = expand(&scenario, &decay(k)).unwrap();
        let result = simulate(&tasks[0], &SolverOptions::default(), None).unwrap();
        let expected = |t: f64| {
            (-k * t).exp() + if t >= 10.0 { (-k * (t - 10.0)).exp() } else { 0.0 }
        };
        for (i, t) in result.times().iter().enumerate() {
            assert_relative_eq!(result.states()[[i, 0]], expected(*t), max_relative = 1e-4);
        }
    }

    #[test]
    fn test_step_budget_diverges() {
        let scenario = Scenario::new("s", Timepoints::List(vec![0.0, 1000.0]))
            .with_dose("iv", vec![bolus(0.0, 1.0)]);
        let tasks = expand(&scenario, &decay(0.1)).unwrap();
        let options = SolverOptions::default().with_max_steps(2);
        let err = simulate(&tasks[0], &options, None).unwrap_err();
        assert!(matches!(err, PbpkError::IntegrationDivergedError { .. }));
    }

    #[test]
    fn test_negative_excursion_reported_once_per_time() {
        let def: ModelDefinition = serde_json::from_str(
            r#"{
                "id": "sink",
                "compartments": [{"id": "V", "size": 1.0}],
                "species": [{"id": "A", "compartment": "V", "initialAmount": 1.0, "amountOnly": true}],
                "parameters": [{"id": "k", "value": 1.0, "unit": "1/min"}],
                "reactions": [{"id": "drain", "equation": "A ->", "rate": "k"}],
                "routes": [{"id": "iv", "target": "A"}]
            }"#,
        )
        .unwrap();
        let model = Arc::new(CompartmentalModel::new(def).unwrap());
        // the empty dose at 4 splits the integration into two segments
        let scenario = Scenario::new("s", Timepoints::List(vec![0.0, 2.0, 4.0, 6.0]))
            .with_dose("split", vec![bolus(0.0, 0.0), bolus(4.0, 0.0)]);
        let tasks = expand(&scenario, &model).unwrap();
        let result = simulate(&tasks[0], &SolverOptions::default(), None).unwrap();

        let times: Vec<f64> = result.warnings().iter().map(|w| w.time).collect();
        assert_eq!(times, vec![2.0, 4.0, 6.0]);
        assert_relative_eq!(result.warnings()[1].value, -3.0, max_relative = 1e-6);
    }

    #[test]
    fn test_wall_time_budget_diverges() {
        let scenario = Scenario::new("s", Timepoints::List(vec![0.0, 1.0e6]))
            .with_dose("iv", vec![bolus(0.0, 1.0)]);
        let tasks = expand(&scenario, &decay(0.1)).unwrap();
        let options = SolverOptions::default().with_max_wall_time(0.0);
        let err = simulate(&tasks[0], &options, None).unwrap_err();
        assert!(matches!(err, PbpkError::IntegrationDivergedError { .. }));
    }

    #[test]
    fn test_cancelled_before_start() {
        let scenario = Scenario::new("s", Timepoints::List(vec![0.0, 1.0]))
            .with_dose("iv", vec![bolus(0.0, 1.0)]);
        let tasks = expand(&scenario, &decay(0.1)).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = simulate(&tasks[0], &SolverOptions::default(), Some(&token)).unwrap_err();
        assert!(matches!(err, PbpkError::CancellationRequested));
    }
}
