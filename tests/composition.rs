use std::sync::Arc;

use approx::assert_relative_eq;
use pbpksim::model::compose::compose_definitions;
use pbpksim::prelude::model::*;
use pbpksim::prelude::scenario::*;
use pbpksim::prelude::*;

fn organ(id: &str, k: f64) -> ModelDefinition {
    parse_model(
        &format!(
            r#"{{
                "id": "{id}",
                "compartments": [
                    {{"id": "Vext", "size": 2.0, "unit": "l", "port": true}},
                    {{"id": "V", "size": 0.5, "unit": "l"}}
                ],
                "species": [
                    {{"id": "c_ext", "compartment": "Vext", "initialConcentration": 0.0, "unit": "mmole", "port": true}},
                    {{"id": "c", "compartment": "V", "initialConcentration": 0.0, "unit": "mmole"}},
                    {{"id": "m", "compartment": "V", "initialConcentration": 0.0, "unit": "mmole"}}
                ],
                "parameters": [
                    {{"id": "k", "value": {k}, "unit": "l/min"}},
                    {{"id": "kmet", "value": 0.05, "unit": "1/min"}}
                ],
                "reactions": [
                    {{"id": "uptake", "equation": "c_ext <-> c", "rate": "k * (c_ext - c)"}},
                    {{"id": "metabolism", "equation": "c -> m", "rate": "kmet * V * c"}}
                ]
            }}"#
        ),
        id,
    )
    .unwrap()
}

fn plasma() -> ModelDefinition {
    parse_model(
        r#"{
            "id": "plasma",
            "compartments": [{"id": "Vext", "size": 2.0, "unit": "l", "port": true}],
            "species": [{"id": "c_ext", "compartment": "Vext", "initialConcentration": 0.0, "unit": "mmole", "port": true}],
            "routes": [{"id": "iv", "target": "c_ext"}],
            "outputs": ["c_ext"]
        }"#,
        "plasma",
    )
    .unwrap()
}

fn submodels() -> Vec<Submodel> {
    vec![
        Submodel::new("plasma", None, plasma()).unwrap(),
        Submodel::new("liver", Some("LI".into()), organ("liver", 0.3)).unwrap(),
        Submodel::new("kidney", Some("KI".into()), organ("kidney", 0.1)).unwrap(),
        Submodel::new("gut", Some("GU".into()), organ("gut", 0.2)).unwrap(),
    ]
}

fn shared_map(submodels: &[&str]) -> CompositionMap {
    let members = |symbol: &str| {
        submodels
            .iter()
            .map(|s| PortRef {
                submodel: s.to_string(),
                symbol: symbol.to_string(),
            })
            .collect()
    };
    CompositionMap::new(vec![
        Correspondence {
            shared: "Vext".into(),
            members: members("Vext"),
        },
        Correspondence {
            shared: "c_ext".into(),
            members: members("c_ext"),
        },
    ])
}

fn trajectory(model: CompartmentalModel) -> (Vec<String>, Vec<f64>) {
    let model = Arc::new(model);
    let scenario = Scenario::new(
        "iv",
        Timepoints::Grid {
            start: 0.0,
            end: 60.0,
            steps: 12,
        },
    )
    .with_dose(
        "bolus",
        vec![DoseEvent {
            route: "iv".into(),
            amount: 1.0,
            time: 0.0,
            repeat: None,
        }],
    );
    let tasks = expand(&scenario, &model).unwrap();
    let result = simulate(&tasks[0], &SolverOptions::default(), None).unwrap();
    (
        result.state_names().to_vec(),
        result.states().iter().copied().collect(),
    )
}

#[test]
fn composition_is_commutative() {
    let all = submodels();
    let mut reversed = all.clone();
    reversed.reverse();
    let map = shared_map(&["plasma", "liver", "kidney", "gut"]);
    let a = compose_definitions("body", &all, &map).unwrap();
    let b = compose_definitions("body", &reversed, &map).unwrap();
    assert_eq!(a, b);
}

#[test]
fn composition_is_associative() {
    let all = submodels();

    // (plasma + liver) + (kidney + gut)
    let left = compose("left", &all[..2], &shared_map(&["plasma", "liver"])).unwrap();
    let right = compose_definitions("right", &all[2..], &shared_map(&["kidney", "gut"])).unwrap();
    let right = Submodel::new("right", None, right).unwrap();
    let nested = compose(
        "body",
        &[left.to_submodel("left", None), right],
        &shared_map(&["left", "right"]),
    )
    .unwrap();

    let flat = compose("body", &all, &shared_map(&["plasma", "liver", "kidney", "gut"])).unwrap();

    let (names_nested, values_nested) = trajectory(nested);
    let (names_flat, values_flat) = trajectory(flat);
    assert_eq!(names_nested, names_flat);
    for (a, b) in values_nested.iter().zip(&values_flat) {
        assert_relative_eq!(*a, *b, epsilon = 1e-12, max_relative = 1e-9);
    }
}

#[test]
fn shared_symbol_value_conflict_is_reported() {
    let mut kidney = organ("kidney", 0.1);
    kidney.compartments[0].size = pbpksim::model::ExpressionOrNumber::Number(3.0);
    let subs = vec![
        Submodel::new("liver", Some("LI".into()), organ("liver", 0.3)).unwrap(),
        Submodel::new("kidney", Some("KI".into()), kidney).unwrap(),
    ];
    let err = compose("body", &subs, &shared_map(&["liver", "kidney"])).unwrap_err();
    assert!(matches!(err, PbpkError::CompositionConflictError { .. }));
}

#[test]
fn duplicate_route_is_a_conflict() {
    let mut liver = organ("liver", 0.3);
    liver.routes.push(serde_json::from_str(r#"{"id": "iv", "target": "c_ext"}"#).unwrap());
    let subs = vec![
        Submodel::new("plasma", None, plasma()).unwrap(),
        Submodel::new("liver", Some("LI".into()), liver).unwrap(),
    ];
    let err = compose("body", &subs, &shared_map(&["plasma", "liver"])).unwrap_err();
    assert!(matches!(err, PbpkError::CompositionConflictError { .. }));
}
