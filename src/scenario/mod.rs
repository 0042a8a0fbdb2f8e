//! Declarative scenarios and their expansion into simulation tasks.
//!
//! A [`Scenario`] combines dose variants, parameter override sets, a
//! timepoint grid and repeated draws. [`expand`] turns it into the Cartesian
//! product of those dimensions, one [`SimulationTask`] per combination, in
//! the order dose variant, parameter combination, repetition.

pub mod values;

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::PbpkError;
use crate::model::CompartmentalModel;
pub use values::{OverrideValues, Range, Scale, Timepoints};

fn one() -> usize {
    1
}

/// Additional doses at a fixed interval after the first one
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Repeat {
    pub every: f64,
    /// Number of additional doses
    pub count: usize,
}

/// A single administration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseEvent {
    pub route: String,
    pub amount: f64,
    #[serde(default)]
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<Repeat>,
}

/// One dosing regimen of a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseVariant {
    pub label: String,
    #[serde(default)]
    pub events: Vec<DoseEvent>,
}

/// Log-normal between-repetition variability of one parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variability {
    pub parameter: String,
    /// Coefficient of variation of the multiplicative factor
    pub cv: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Dose variants; an empty list simulates the undosed model once
    #[serde(default)]
    pub doses: Vec<DoseVariant>,
    #[serde(default)]
    pub overrides: BTreeMap<String, OverrideValues>,
    pub timepoints: Timepoints,
    #[serde(default = "one")]
    pub repetitions: usize,
    #[serde(default)]
    pub variability: Vec<Variability>,
    #[serde(default)]
    pub seed: u64,
}

impl Scenario {
    pub fn new(id: impl Into<String>, timepoints: Timepoints) -> Self {
        Self {
            id: id.into(),
            description: None,
            doses: Vec::new(),
            overrides: BTreeMap::new(),
            timepoints,
            repetitions: 1,
            variability: Vec::new(),
            seed: 0,
        }
    }

    pub fn with_dose(mut self, label: impl Into<String>, events: Vec<DoseEvent>) -> Self {
        self.doses.push(DoseVariant {
            label: label.into(),
            events,
        });
        self
    }

    pub fn with_override(mut self, parameter: impl Into<String>, values: impl Into<OverrideValues>) -> Self {
        self.overrides.insert(parameter.into(), values.into());
        self
    }

    pub fn with_repetitions(mut self, repetitions: usize, seed: u64) -> Self {
        self.repetitions = repetitions;
        self.seed = seed;
        self
    }

    pub fn with_variability(mut self, parameter: impl Into<String>, cv: f64) -> Self {
        self.variability.push(Variability {
            parameter: parameter.into(),
            cv,
        });
        self
    }

    /// Number of tasks the scenario expands to
    pub fn task_count(&self) -> Result<usize, PbpkError> {
        let mut sizes = vec![self.doses.len().max(1), self.repetitions];
        for (name, values) in &self.overrides {
            let values = values
                .values()
                .map_err(|e| PbpkError::scenario(&self.id, format!("override '{}': {}", name, e)))?;
            sizes.push(values.len());
        }
        checked_product(&self.id, sizes)
    }
}

/// Where a task sits in its scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskIdentity {
    /// Position in the expanded task sequence
    pub index: usize,
    pub scenario: String,
    pub dose_index: usize,
    pub dose_label: String,
    pub combination: usize,
    pub repetition: usize,
    /// Overridden parameter values, by name
    pub overrides: Vec<(String, f64)>,
}

/// A dose resolved to a jump of one state variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DosingEvent {
    pub time: f64,
    pub route: String,
    pub state: usize,
    /// Amount as administered
    pub amount: f64,
    /// Change of the target state after the route factor
    pub delta: f64,
}

/// A fully resolved, immutable unit of work for the integrator
#[derive(Debug, Clone)]
pub struct SimulationTask {
    identity: TaskIdentity,
    model: Arc<CompartmentalModel>,
    parameters: Vec<f64>,
    initial_state: Vec<f64>,
    t0: f64,
    events: Vec<DosingEvent>,
    timepoints: Vec<f64>,
}

impl SimulationTask {
    /// Build a task; events are sorted by time and the initial state is
    /// derived from the model at `t0`
    pub fn new(
        identity: TaskIdentity,
        model: Arc<CompartmentalModel>,
        parameters: Vec<f64>,
        mut events: Vec<DosingEvent>,
        timepoints: Vec<f64>,
    ) -> Self {
        events.sort_by(|a, b| a.time.total_cmp(&b.time));
        let t0 = events
            .first()
            .map(|e| e.time)
            .or_else(|| timepoints.first().copied())
            .unwrap_or(0.0);
        let initial_state = model.initial_state(&parameters, t0);
        Self {
            identity,
            model,
            parameters,
            initial_state,
            t0,
            events,
            timepoints,
        }
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    pub fn model(&self) -> &Arc<CompartmentalModel> {
        &self.model
    }

    pub fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    pub fn initial_state(&self) -> &[f64] {
        &self.initial_state
    }

    /// Start of integration
    pub fn t0(&self) -> f64 {
        self.t0
    }

    pub fn events(&self) -> &[DosingEvent] {
        &self.events
    }

    pub fn timepoints(&self) -> &[f64] {
        &self.timepoints
    }

    /// Events the integrator applies: those at or before the last timepoint
    pub fn applied_events(&self) -> impl Iterator<Item = &DosingEvent> {
        let horizon = self.timepoints.last().copied().unwrap_or(f64::NEG_INFINITY);
        self.events.iter().filter(move |e| e.time <= horizon)
    }

    /// Applied amount in model substance units, after route factors
    pub fn total_dose(&self) -> f64 {
        self.applied_events().map(|e| e.delta).sum()
    }

    /// Sum of applied amounts as administered
    pub fn administered(&self) -> f64 {
        self.applied_events().map(|e| e.amount).sum()
    }

    /// Names of the states that receive an applied dose, sorted
    pub fn dosed_states(&self) -> Vec<String> {
        let states = self.model.states();
        let mut names: Vec<String> = self
            .applied_events()
            .filter(|e| e.delta > 0.0)
            .map(|e| states[e.state].id.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

fn expand_events(scenario: &Scenario, variant: &DoseVariant) -> Result<Vec<(String, f64, f64)>, PbpkError> {
    let err = |msg: String| PbpkError::scenario(&scenario.id, format!("dose '{}': {}", variant.label, msg));
    let mut out = Vec::new();
    for event in &variant.events {
        if !event.amount.is_finite() || event.amount < 0.0 {
            return Err(err(format!("invalid amount {}", event.amount)));
        }
        if !event.time.is_finite() || event.time < 0.0 {
            return Err(err(format!("invalid dose time {}", event.time)));
        }
        out.push((event.route.clone(), event.amount, event.time));
        if let Some(repeat) = event.repeat {
            if repeat.every.is_nan() || repeat.every <= 0.0 {
                return Err(err(format!("repeat interval must be positive, got {}", repeat.every)));
            }
            for k in 1..=repeat.count {
                out.push((event.route.clone(), event.amount, event.time + repeat.every * k as f64));
            }
        }
    }
    out.sort_by(|a, b| a.2.total_cmp(&b.2));
    Ok(out)
}

/// Multiplicative factors of repetition `r`, sorted by parameter index
fn draw_factors(
    scenario: &Scenario,
    variability: &[(usize, f64)],
    r: usize,
) -> Result<Vec<(usize, f64)>, PbpkError> {
    let mut rng = StdRng::seed_from_u64(scenario.seed.wrapping_add(r as u64));
    variability
        .iter()
        .map(|&(index, cv)| {
            let sigma = (1.0 + cv * cv).ln().sqrt();
            let normal = Normal::new(0.0, sigma)
                .map_err(|e| PbpkError::scenario(&scenario.id, e.to_string()))?;
            Ok((index, normal.sample(&mut rng).exp()))
        })
        .collect()
}

/// Product of the axis sizes of a scenario; an error when it overflows
fn checked_product(
    scenario: &str,
    sizes: impl IntoIterator<Item = usize>,
) -> Result<usize, PbpkError> {
    sizes
        .into_iter()
        .try_fold(1usize, |n, size| n.checked_mul(size))
        .ok_or_else(|| PbpkError::scenario(scenario, "too many tasks to enumerate"))
}

/// Expand a scenario into its ordered task sequence
pub fn expand(
    scenario: &Scenario,
    model: &Arc<CompartmentalModel>,
) -> Result<Vec<SimulationTask>, PbpkError> {
    let err = |msg: String| PbpkError::scenario(&scenario.id, msg);

    if scenario.repetitions == 0 {
        return Err(err("at least one repetition is required".to_string()));
    }

    let timepoints = scenario.timepoints.values();
    if timepoints.is_empty() {
        return Err(err("no timepoints".to_string()));
    }
    if timepoints.iter().any(|t| !t.is_finite() || *t < 0.0) {
        return Err(err("timepoints must be finite and non-negative".to_string()));
    }
    if timepoints.windows(2).any(|w| w[1] <= w[0]) {
        return Err(err("timepoints must be strictly increasing".to_string()));
    }

    // Dose variants
    let implicit = DoseVariant {
        label: "none".to_string(),
        events: Vec::new(),
    };
    let variants: Vec<&DoseVariant> = if scenario.doses.is_empty() {
        vec![&implicit]
    } else {
        scenario.doses.iter().collect()
    };
    let mut schedules = Vec::with_capacity(variants.len());
    for variant in &variants {
        let events = expand_events(scenario, variant)?;
        for (route, _, _) in &events {
            if model.route_index(route).is_none() {
                return Err(err(format!("unknown dosing route '{}'", route)));
            }
        }
        if let Some((_, _, first)) = events.first() {
            if timepoints[0] < *first {
                return Err(err(format!(
                    "dose '{}': first timepoint {} precedes the first dose at {}",
                    variant.label, timepoints[0], first
                )));
            }
        }
        schedules.push(events);
    }

    // Parameter combinations, last name varying fastest
    let mut axes = Vec::with_capacity(scenario.overrides.len());
    for (name, values) in &scenario.overrides {
        let index = model
            .parameter_index(name)
            .ok_or_else(|| err(format!("unknown parameter '{}'", name)))?;
        let values = values
            .values()
            .map_err(|e| err(format!("override '{}': {}", name, e)))?;
        axes.push((name.clone(), index, values));
    }
    let ncombinations = checked_product(&scenario.id, axes.iter().map(|(_, _, v)| v.len()))?;
    let ntasks = checked_product(
        &scenario.id,
        [variants.len(), ncombinations, scenario.repetitions],
    )?;

    let mut variability: Vec<(usize, f64)> = Vec::with_capacity(scenario.variability.len());
    for v in &scenario.variability {
        let index = model
            .parameter_index(&v.parameter)
            .ok_or_else(|| err(format!("unknown parameter '{}' in variability", v.parameter)))?;
        if !v.cv.is_finite() || v.cv < 0.0 {
            return Err(err(format!("invalid cv {} for '{}'", v.cv, v.parameter)));
        }
        variability.push((index, v.cv));
    }
    variability.sort_by_key(|(index, _)| *index);

    let draws = (0..scenario.repetitions)
        .map(|r| draw_factors(scenario, &variability, r))
        .collect::<Result<Vec<_>, _>>()?;

    let defaults = model.default_parameters();
    let mut tasks = Vec::with_capacity(ntasks);
    for (d, (variant, schedule)) in variants.iter().zip(&schedules).enumerate() {
        for c in 0..ncombinations {
            let mut overrides = Vec::with_capacity(axes.len());
            let mut parameters = defaults.clone();
            let mut rest = c;
            for (name, index, values) in axes.iter().rev() {
                let value = values[rest % values.len()];
                rest /= values.len();
                parameters[*index] = value;
                overrides.push((name.clone(), value));
            }
            overrides.reverse();

            for (r, factors) in draws.iter().enumerate() {
                let mut parameters = parameters.clone();
                for &(index, factor) in factors {
                    parameters[index] *= factor;
                }
                let mut events = Vec::with_capacity(schedule.len());
                for (route, amount, time) in schedule {
                    let route_index = model
                        .route_index(route)
                        .ok_or_else(|| err(format!("unknown dosing route '{}'", route)))?;
                    let (state, delta) = model.dose_delta(route_index, *amount, &parameters);
                    events.push(DosingEvent {
                        time: *time,
                        route: route.clone(),
                        state,
                        amount: *amount,
                        delta,
                    });
                }
                let identity = TaskIdentity {
                    index: tasks.len(),
                    scenario: scenario.id.clone(),
                    dose_index: d,
                    dose_label: variant.label.clone(),
                    combination: c,
                    repetition: r,
                    overrides: overrides.clone(),
                };
                tasks.push(SimulationTask::new(
                    identity,
                    Arc::clone(model),
                    parameters,
                    events,
                    timepoints.clone(),
                ));
            }
        }
    }

    tracing::info!(
        scenario = %scenario.id,
        doses = variants.len(),
        combinations = ncombinations,
        repetitions = scenario.repetitions,
        tasks = tasks.len(),
        "expanded scenario"
    );
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelDefinition;

    fn model() -> Arc<CompartmentalModel> {
        let def: ModelDefinition = serde_json::from_str(
            r#"{
                "id": "pk",
                "compartments": [{"id": "V", "size": "Vd"}],
                "species": [{"id": "C", "compartment": "V"}],
                "parameters": [
                    {"id": "Vd", "value": 5.0, "unit": "l"},
                    {"id": "CL", "value": 1.0, "unit": "l/min"},
                    {"id": "F", "value": 0.5}
                ],
                "reactions": [{"id": "elim", "equation": "C ->", "rate": "CL * C"}],
                "routes": [
                    {"id": "iv", "target": "C"},
                    {"id": "po", "target": "C", "factor": "F"}
                ]
            }"#,
        )
        .unwrap();
        Arc::new(CompartmentalModel::new(def).unwrap())
    }

    fn grid() -> Timepoints {
        Timepoints::Grid {
            start: 0.0,
            end: 10.0,
            steps: 10,
        }
    }

    fn dose(route: &str, amount: f64) -> Vec<DoseEvent> {
        vec![DoseEvent {
            route: route.into(),
            amount,
            time: 0.0,
            repeat: None,
        }]
    }

    #[test]
    fn test_expansion_count_and_order() {
        let scenario = Scenario::new("s", grid())
            .with_dose("low", dose("iv", 1.0))
            .with_dose("high", dose("po", 2.0))
            .with_override("Vd", vec![4.0, 5.0, 6.0])
            .with_override("CL", vec![1.0, 2.0])
            .with_repetitions(2, 7);
        let tasks = expand(&scenario, &model()).unwrap();
        assert_eq!(tasks.len(), 2 * 3 * 2 * 2);
        assert_eq!(scenario.task_count().unwrap(), tasks.len());

        let keys: Vec<(usize, usize, usize)> = tasks
            .iter()
            .map(|t| {
                let id = t.identity();
                (id.dose_index, id.combination, id.repetition)
            })
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(tasks.iter().enumerate().all(|(i, t)| t.identity().index == i));

        // names are ordered lexicographically and the last one varies fastest
        let first = &tasks[0].identity().overrides;
        assert_eq!(first, &vec![("CL".to_string(), 1.0), ("Vd".to_string(), 4.0)]);
        let second = &tasks[2].identity().overrides;
        assert_eq!(second, &vec![("CL".to_string(), 1.0), ("Vd".to_string(), 5.0)]);
    }

    #[test]
    fn test_route_factor_and_dose() {
        let scenario = Scenario::new("s", grid()).with_dose("po", dose("po", 10.0));
        let tasks = expand(&scenario, &model()).unwrap();
        assert_eq!(tasks[0].events()[0].delta, 5.0);
        assert_eq!(tasks[0].total_dose(), 5.0);
        assert_eq!(tasks[0].administered(), 10.0);
    }

    #[test]
    fn test_repeated_doses() {
        let events = vec![DoseEvent {
            route: "iv".into(),
            amount: 1.0,
            time: 0.0,
            repeat: Some(Repeat { every: 2.5, count: 3 }),
        }];
        let scenario = Scenario::new("s", grid()).with_dose("qd", events);
        let tasks = expand(&scenario, &model()).unwrap();
        let times: Vec<f64> = tasks[0].events().iter().map(|e| e.time).collect();
        assert_eq!(times, vec![0.0, 2.5, 5.0, 7.5]);
    }

    #[test]
    fn test_variability_is_shared_across_doses() {
        let scenario = Scenario::new("s", grid())
            .with_dose("a", dose("iv", 1.0))
            .with_dose("b", dose("iv", 2.0))
            .with_repetitions(3, 42)
            .with_variability("CL", 0.3);
        let tasks = expand(&scenario, &model()).unwrap();
        let cl = |i: usize| tasks[i].parameters()[1];
        for r in 0..3 {
            assert_eq!(cl(r), cl(3 + r));
        }
        assert_ne!(cl(0), cl(1));
        let again = expand(&scenario, &model()).unwrap();
        assert_eq!(again[2].parameters(), tasks[2].parameters());
    }

    #[test]
    fn test_scenario_errors() {
        let m = model();
        let unknown_route = Scenario::new("s", grid()).with_dose("x", dose("im", 1.0));
        assert!(matches!(expand(&unknown_route, &m), Err(PbpkError::ScenarioError { .. })));

        let unknown_param = Scenario::new("s", grid()).with_override("Q", 1.0);
        assert!(expand(&unknown_param, &m).is_err());

        let unordered = Scenario::new("s", Timepoints::List(vec![0.0, 2.0, 1.0]));
        assert!(expand(&unordered, &m).is_err());

        let mut late = dose("iv", 1.0);
        late[0].time = 5.0;
        let before_dose = Scenario::new("s", grid()).with_dose("late", late);
        assert!(expand(&before_dose, &m).is_err());
    }

    #[test]
    fn test_doses_after_last_timepoint_are_not_applied() {
        let mut events = dose("iv", 1.0);
        events.push(DoseEvent {
            route: "po".into(),
            amount: 4.0,
            time: 50.0,
            repeat: None,
        });
        let scenario = Scenario::new("s", grid()).with_dose("late", events);
        let tasks = expand(&scenario, &model()).unwrap();
        assert_eq!(tasks[0].events().len(), 2);
        assert_eq!(tasks[0].applied_events().count(), 1);
        assert_eq!(tasks[0].total_dose(), 1.0);
        assert_eq!(tasks[0].administered(), 1.0);
        assert_eq!(tasks[0].dosed_states(), vec!["C".to_string()]);
    }

    #[test]
    fn test_task_count_overflow() {
        let scenario = Scenario::new("s", grid())
            .with_dose("a", dose("iv", 1.0))
            .with_dose("b", dose("iv", 2.0))
            .with_repetitions(usize::MAX, 0);
        assert!(matches!(
            scenario.task_count(),
            Err(PbpkError::ScenarioError { .. })
        ));
        assert!(matches!(
            expand(&scenario, &model()),
            Err(PbpkError::ScenarioError { .. })
        ));
    }

    #[test]
    fn test_undosed_scenario() {
        let tasks = expand(&Scenario::new("s", grid()), &model()).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].identity().dose_label, "none");
        assert_eq!(tasks[0].t0(), 0.0);
    }
}
