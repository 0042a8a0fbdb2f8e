use std::sync::Arc;

use approx::assert_relative_eq;
use pbpksim::prelude::model::*;
use pbpksim::prelude::scenario::*;
use pbpksim::prelude::*;

/// Oral absorption into a central compartment with linear elimination
/// and a peripheral compartment
fn two_compartment() -> Arc<CompartmentalModel> {
    let def = parse_model(
        r#"{
            "id": "two_compartment",
            "compartments": [
                {"id": "Vgut", "size": 1.0, "unit": "l"},
                {"id": "Vc", "size": "Vc0", "unit": "l"},
                {"id": "Vp", "size": 10.0, "unit": "l"},
                {"id": "Vout", "size": 1.0, "unit": "l"}
            ],
            "species": [
                {"id": "gut", "compartment": "Vgut", "initialAmount": 0.0, "unit": "mmole", "amountOnly": true},
                {"id": "C", "compartment": "Vc", "initialConcentration": 0.0, "unit": "mmole"},
                {"id": "P", "compartment": "Vp", "initialConcentration": 0.0, "unit": "mmole"},
                {"id": "eliminated", "compartment": "Vout", "initialAmount": 0.0, "unit": "mmole", "amountOnly": true}
            ],
            "parameters": [
                {"id": "ka", "value": 0.05, "unit": "1/min"},
                {"id": "Vc0", "value": 5.0, "unit": "l"},
                {"id": "Q", "value": 0.2, "unit": "l/min"},
                {"id": "CL", "value": 0.1, "unit": "l/min"},
                {"id": "F", "value": 0.8, "unit": "dimensionless"}
            ],
            "reactions": [
                {"id": "absorption", "equation": "gut -> C", "rate": "ka * gut"},
                {"id": "distribution", "equation": "C <-> P", "rate": "Q * (C - P)"},
                {"id": "elimination", "equation": "C -> eliminated", "rate": "CL * C"}
            ],
            "routes": [
                {"id": "po", "target": "gut", "factor": "F"},
                {"id": "iv", "target": "C"}
            ],
            "outputs": ["C"]
        }"#,
        "two_compartment",
    )
    .unwrap();
    Arc::new(CompartmentalModel::new(def).unwrap())
}

fn dose(route: &str, amount: f64, time: f64) -> DoseEvent {
    DoseEvent {
        route: route.into(),
        amount,
        time,
        repeat: None,
    }
}

fn grid(end: f64, steps: usize) -> Timepoints {
    Timepoints::Grid {
        start: 0.0,
        end,
        steps,
    }
}

fn scan_scenario() -> Scenario {
    Scenario::new("scan", grid(600.0, 60))
        .with_dose("po_1", vec![dose("po", 1.0, 0.0)])
        .with_dose("iv_2", vec![dose("iv", 2.0, 0.0)])
        .with_override(
            "CL",
            OverrideValues::Range {
                range: Range {
                    start: 0.01,
                    end: 1.0,
                    num: 4,
                    scale: Scale::Log,
                    include: vec![0.1],
                },
            },
        )
        .with_override("Q", vec![0.1, 0.4])
        .with_repetitions(3, 11)
        .with_variability("ka", 0.25)
}

#[test]
fn expansion_count_is_the_cartesian_product() {
    let scenario = scan_scenario();
    let tasks = expand(&scenario, &two_compartment()).unwrap();
    assert_eq!(tasks.len(), 2 * 5 * 2 * 3);
    assert_eq!(scenario.task_count().unwrap(), tasks.len());
}

#[test]
fn results_do_not_depend_on_concurrency() {
    let tasks = expand(&scan_scenario(), &two_compartment()).unwrap();
    let cancel = CancellationToken::new();
    let serial = run_scan(&tasks, &ScanOptions::default().with_concurrency(1), &cancel).unwrap();
    let parallel = run_scan(&tasks, &ScanOptions::default().with_concurrency(4), &cancel).unwrap();

    assert_eq!(serial.len(), parallel.len());
    for (a, b) in serial.iter().zip(&parallel) {
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.status(), b.status());
        assert_eq!(a.times(), b.times());
        // bitwise identical trajectories
        assert_eq!(a.states(), b.states());
    }

    let options = AggregateOptions::default();
    let table_a = aggregate(&serial, &options).unwrap();
    let table_b = aggregate(&parallel, &options).unwrap();
    assert_eq!(table_a, table_b);
}

#[test]
fn mass_is_conserved() {
    let model = two_compartment();
    let scenario = Scenario::new("mass", grid(1200.0, 40)).with_dose(
        "po",
        vec![dose("po", 10.0, 0.0), dose("iv", 5.0, 300.0)],
    );
    let tasks = expand(&scenario, &model).unwrap();
    let result = simulate(&tasks[0], &SolverOptions::default(), None).unwrap();

    for (i, t) in result.times().iter().enumerate() {
        let total: f64 = result.states().row(i).sum();
        let dosed = if *t >= 300.0 { 0.8 * 10.0 + 5.0 } else { 0.8 * 10.0 };
        assert_relative_eq!(total, dosed, max_relative = 1e-5);
    }
}

#[test]
fn states_stay_non_negative() {
    let tasks = expand(&scan_scenario(), &two_compartment()).unwrap();
    let results = run_scan(&tasks, &ScanOptions::default(), &CancellationToken::new()).unwrap();
    for result in &results {
        assert!(result.is_completed());
        assert!(result.warnings().is_empty());
        assert!(result.states().iter().all(|v| *v >= 0.0));
    }
}

#[test]
fn linear_model_superposes_doses() {
    let model = two_compartment();
    let run = |events: Vec<DoseEvent>| {
        let scenario = Scenario::new("s", grid(900.0, 45)).with_dose("d", events);
        let tasks = expand(&scenario, &model).unwrap();
        simulate(&tasks[0], &SolverOptions::default().with_tolerances(1e-8, 1e-12), None).unwrap()
    };
    let first = run(vec![dose("iv", 1.0, 0.0)]);
    let both = run(vec![dose("iv", 1.0, 0.0), dose("iv", 1.0, 300.0)]);

    let c = first.series("C").unwrap();
    let c_both = both.series("C").unwrap();
    for (i, t) in first.times().iter().enumerate() {
        let shifted = if *t >= 300.0 {
            // sample of the single dose 300 minutes earlier
            c[i - 15]
        } else {
            0.0
        };
        assert_relative_eq!(c_both[i], c[i] + shifted, epsilon = 1e-9, max_relative = 1e-5);
    }
}

#[test]
fn doubling_the_dose_doubles_concentrations() {
    let model = two_compartment();
    let run = |amount: f64| {
        let scenario = Scenario::new("s", grid(900.0, 45))
            .with_dose("d", vec![dose("po", amount, 0.0), dose("iv", amount, 200.0)]);
        let tasks = expand(&scenario, &model).unwrap();
        simulate(&tasks[0], &SolverOptions::default().with_tolerances(1e-8, 1e-12), None).unwrap()
    };
    let single = run(1.0);
    let double = run(2.0);
    let c1 = single.series("C").unwrap();
    let c2 = double.series("C").unwrap();
    assert!(c1.iter().any(|c| *c > 0.0));
    for i in 0..c1.len() {
        assert_relative_eq!(c2[i], 2.0 * c1[i], epsilon = 1e-9, max_relative = 1e-5);
    }
}

#[test]
fn exhausted_wall_time_marks_the_task_diverged() {
    let scenario = Scenario::new("slow", grid(1.0e6, 10))
        .with_dose("iv", vec![dose("iv", 1.0, 0.0)]);
    let tasks = expand(&scenario, &two_compartment()).unwrap();
    let options = ScanOptions::default()
        .with_solver(SolverOptions::default().with_max_wall_time(0.0));
    let results = run_scan(&tasks, &options, &CancellationToken::new()).unwrap();
    assert!(matches!(results[0].status(), TaskStatus::Diverged { .. }));
}

/// Parent drug in plasma forming an eliminated metabolite
fn parent_metabolite() -> Arc<CompartmentalModel> {
    let def = parse_model(
        r#"{
            "id": "parent_metabolite",
            "compartments": [{"id": "V", "size": 5.0, "unit": "l"}],
            "species": [
                {"id": "C", "compartment": "V", "initialConcentration": 0.0, "unit": "mmole"},
                {"id": "M", "compartment": "V", "initialConcentration": 0.0, "unit": "mmole"}
            ],
            "parameters": [
                {"id": "CL", "value": 0.5, "unit": "l/min"},
                {"id": "CLm", "value": 2.0, "unit": "l/min"}
            ],
            "reactions": [
                {"id": "metabolism", "equation": "C -> M", "rate": "CL * C"},
                {"id": "excretion", "equation": "M ->", "rate": "CLm * M"}
            ],
            "routes": [{"id": "iv", "target": "C"}],
            "outputs": ["C", "M"]
        }"#,
        "parent_metabolite",
    )
    .unwrap();
    Arc::new(CompartmentalModel::new(def).unwrap())
}

fn summary_of<'a>(table: &'a ResultTable, observable: &str) -> &'a PkSummary {
    table
        .rows()
        .iter()
        .find(|r| r.observable.as_deref() == Some(observable))
        .and_then(|r| r.pk.as_ref())
        .unwrap()
}

#[test]
fn dose_beyond_the_last_sample_leaves_clearance_unchanged() {
    let model = parent_metabolite();
    let table = |events: Vec<DoseEvent>| {
        let scenario = Scenario::new("late", grid(100.0, 100)).with_dose("d", events);
        let tasks = expand(&scenario, &model).unwrap();
        let options = ScanOptions::default()
            .with_solver(SolverOptions::default().with_tolerances(1e-8, 1e-12));
        let results = run_scan(&tasks, &options, &CancellationToken::new()).unwrap();
        aggregate(&results, &AggregateOptions::default()).unwrap()
    };
    let single = table(vec![dose("iv", 1.0, 0.0)]);
    let with_late = table(vec![dose("iv", 1.0, 0.0), dose("iv", 1.0, 500.0)]);

    let cl = summary_of(&single, "C").cl.unwrap();
    assert_relative_eq!(cl, 0.5, max_relative = 1e-2);
    assert_eq!(summary_of(&with_late, "C").cl, Some(cl));
    assert_eq!(with_late.tasks()[0].total_dose, 1.0);
}

#[test]
fn metabolite_gets_no_clearance() {
    let model = parent_metabolite();
    let scenario = Scenario::new("metabolite", grid(100.0, 100))
        .with_dose("iv", vec![dose("iv", 1.0, 0.0)]);
    let tasks = expand(&scenario, &model).unwrap();
    let results = run_scan(&tasks, &ScanOptions::default(), &CancellationToken::new()).unwrap();

    // doses land in C, so only C is attributed the dose
    let table = aggregate(&results, &AggregateOptions::default()).unwrap();
    assert!(summary_of(&table, "C").cl.is_some());
    let metabolite = summary_of(&table, "M");
    assert!(metabolite.auc > 0.0);
    assert!(metabolite.cl.is_none());
    assert!(metabolite.vd.is_none());

    let options = AggregateOptions::default().with_dosed_observables(["M"]);
    let table = aggregate(&results, &options).unwrap();
    assert!(summary_of(&table, "C").cl.is_none());
}

#[test]
fn one_failing_task_does_not_stop_the_scan() {
    let def = parse_model(
        r#"{
            "id": "fragile",
            "compartments": [{"id": "V", "size": 1.0, "unit": "l"}],
            "species": [{"id": "A", "compartment": "V", "initialAmount": 0.0, "unit": "mmole", "amountOnly": true}],
            "parameters": [{"id": "k", "value": 0.1}],
            "reactions": [{"id": "elim", "equation": "A ->", "rate": "sqrt(k) * A"}],
            "routes": [{"id": "iv", "target": "A"}]
        }"#,
        "fragile",
    )
    .unwrap();
    let model = Arc::new(CompartmentalModel::new(def).unwrap());
    let ks = vec![0.01, 0.02, 0.03, 0.04, -1.0, 0.06, 0.07, 0.08, 0.09, 0.1];
    let scenario = Scenario::new("fragile", grid(10.0, 10))
        .with_dose("iv", vec![dose("iv", 1.0, 0.0)])
        .with_override("k", ks);
    let tasks = expand(&scenario, &model).unwrap();
    let results = run_scan(&tasks, &ScanOptions::default(), &CancellationToken::new()).unwrap();

    assert_eq!(results.len(), 10);
    let failed: Vec<usize> = results
        .iter()
        .filter(|r| !r.is_completed())
        .map(|r| r.identity().index)
        .collect();
    assert_eq!(failed, vec![4]);
    assert!(matches!(results[4].status(), TaskStatus::Diverged { .. }));

    let table = aggregate(&results, &AggregateOptions::default()).unwrap();
    // one summary row per task even without outputs or samples
    assert_eq!(table.rows().len(), 10);
    for row in table.rows() {
        assert_eq!(row.pk.is_none(), row.task.index == 4);
    }
}

#[test]
fn cancelled_scan_keeps_its_shape() {
    let tasks = expand(&scan_scenario(), &two_compartment()).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let results = run_scan(&tasks, &ScanOptions::default(), &cancel).unwrap();
    assert_eq!(results.len(), tasks.len());
    assert!(results
        .iter()
        .all(|r| matches!(r.status(), TaskStatus::Cancelled)));
}
