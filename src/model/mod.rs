//! Compartmental models: exchange-format types, validation, composition and
//! the compiled, immutable [`CompartmentalModel`] used during integration.

pub mod compose;
pub mod expr;
pub mod loader;
pub mod types;
pub mod units;
pub mod validation;

use std::collections::HashMap;

use expr::{parse_expression, Expr, Frame, Node, Slot};
pub use compose::{compose, CompositionMap, Correspondence, PortRef, Submodel};
pub use loader::{load_definition, load_model, parse_model};
pub use types::*;
pub use validation::{ValidatedModel, ValidationMode, Validator};

use crate::error::PbpkError;

/// Initial condition of a state variable
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitialValue {
    Amount(f64),
    /// Converted to an amount with the compartment size at the start time
    Concentration { value: f64, compartment: usize },
}

/// One entry of the ordered state vector
#[derive(Debug, Clone, PartialEq)]
pub struct StateVariable {
    pub id: String,
    pub unit: String,
    pub initial: InitialValue,
    /// Amounts are physically non-negative; parameter states are not
    pub nonnegative: bool,
}

/// A dosing route resolved to a state index
#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub state: usize,
    factor: Option<Node>,
}

/// A validated and compiled model, ready to be integrated.
///
/// The state vector holds species amounts followed by parameters driven by
/// rate rules. Species declared as concentrations are stored as amounts and
/// divided by their compartment size whenever an expression reads them.
#[derive(Debug, Clone)]
pub struct CompartmentalModel {
    definition: ModelDefinition,
    states: Vec<StateVariable>,
    parameters: Vec<String>,
    defaults: Vec<f64>,
    compartments: Vec<String>,
    sizes: Vec<Node>,
    assignments: Vec<Node>,
    fluxes: Vec<Node>,
    stoichiometry: Vec<Vec<(usize, f64)>>,
    rules: Vec<(usize, Node)>,
    routes: Vec<Route>,
    outputs: Vec<(String, Node)>,
}

impl CompartmentalModel {
    /// Validate a complete model definition and compile it
    pub fn new(definition: ModelDefinition) -> Result<Self, PbpkError> {
        let validated = Validator::default().validate(&definition)?;
        Self::compile(validated)
    }

    pub fn compile(validated: ValidatedModel) -> Result<Self, PbpkError> {
        let order = validated.assignment_order().to_vec();
        let def = validated.into_inner();
        let invalid = |msg: String| PbpkError::validation(&def.id, msg);

        let ruled_parameters: Vec<&ParameterDef> = def
            .parameters
            .iter()
            .filter(|p| def.rate_rules.iter().any(|r| r.target == p.id))
            .collect();
        let fixed: Vec<&ParameterDef> = def
            .parameters
            .iter()
            .filter(|p| !def.rate_rules.iter().any(|r| r.target == p.id))
            .collect();

        let compartment_index: HashMap<&str, usize> = def
            .compartments
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.as_str(), i))
            .collect();

        let mut slots: HashMap<String, Slot> = HashMap::new();
        let mut states = Vec::new();

        for (i, c) in def.compartments.iter().enumerate() {
            slots.insert(c.id.clone(), Slot::Compartment(i));
        }
        for s in &def.species {
            let index = states.len();
            let compartment = compartment_index[s.compartment.as_str()];
            let initial = match (s.amount_only, s.initial_amount, s.initial_concentration) {
                (false, None, Some(c)) => InitialValue::Concentration {
                    value: c,
                    compartment,
                },
                (_, Some(a), _) => InitialValue::Amount(a),
                (true, None, Some(c)) => InitialValue::Concentration {
                    value: c,
                    compartment,
                },
                (_, None, None) => InitialValue::Amount(0.0),
            };
            let slot = if s.amount_only {
                Slot::Amount(index)
            } else {
                Slot::Concentration {
                    state: index,
                    compartment,
                }
            };
            slots.insert(s.id.clone(), slot);
            states.push(StateVariable {
                id: s.id.clone(),
                unit: s.unit.clone().unwrap_or_else(|| def.units.substance.clone()),
                initial,
                nonnegative: s.nonnegative,
            });
        }
        for p in &ruled_parameters {
            slots.insert(p.id.clone(), Slot::Amount(states.len()));
            states.push(StateVariable {
                id: p.id.clone(),
                unit: p.unit.clone().unwrap_or_else(|| "dimensionless".to_string()),
                initial: InitialValue::Amount(p.value),
                nonnegative: false,
            });
        }
        for (i, p) in fixed.iter().enumerate() {
            slots.insert(p.id.clone(), Slot::Param(i));
        }
        for (position, &i) in order.iter().enumerate() {
            slots.insert(def.assignments[i].id.clone(), Slot::Assigned(position));
        }

        let resolve = |name: &str| slots.get(name).copied();
        let compile = |what: &str, source: &str| -> Result<Node, PbpkError> {
            let expr: Expr = parse_expression(source)
                .map_err(|e| PbpkError::parse(&def.id, format!("{}: {}", what, e)))?;
            Node::compile(&expr, &resolve).map_err(|e| invalid(format!("{}: {}", what, e)))
        };

        let sizes = def
            .compartments
            .iter()
            .map(|c| match &c.size {
                ExpressionOrNumber::Number(v) => Ok(Node::Const(*v)),
                ExpressionOrNumber::Expression(e) => compile(&c.id, e.as_str()),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let assignments = order
            .iter()
            .map(|&i| {
                let a = &def.assignments[i];
                compile(&a.id, a.expression.as_str())
            })
            .collect::<Result<Vec<_>, _>>()?;

        let state_index: HashMap<&str, usize> = states
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        let constant: Vec<bool> = def.species.iter().map(|s| s.constant).collect();

        let mut fluxes = Vec::with_capacity(def.reactions.len());
        let mut stoichiometry = Vec::with_capacity(def.reactions.len());
        for r in &def.reactions {
            fluxes.push(compile(&r.id, r.rate.as_str())?);
            let terms = r
                .equation
                .net_stoichiometry()
                .into_iter()
                .filter(|(_, coef)| *coef != 0.0)
                .map(|(species, coef)| (state_index[species.as_str()], coef))
                .filter(|(state, _)| !constant[*state])
                .collect();
            stoichiometry.push(terms);
        }

        let rules = def
            .rate_rules
            .iter()
            .map(|r| Ok((state_index[r.target.as_str()], compile(&r.target, r.expression.as_str())?)))
            .collect::<Result<Vec<_>, PbpkError>>()?;

        let routes = def
            .routes
            .iter()
            .map(|r| {
                Ok(Route {
                    id: r.id.clone(),
                    state: state_index[r.target.as_str()],
                    factor: r
                        .factor
                        .as_ref()
                        .map(|f| compile(&r.id, f.as_str()))
                        .transpose()?,
                })
            })
            .collect::<Result<Vec<_>, PbpkError>>()?;

        let outputs = def
            .outputs
            .iter()
            .map(|o| Ok((o.clone(), compile(o, o)?)))
            .collect::<Result<Vec<_>, PbpkError>>()?;

        let parameters = fixed.iter().map(|p| p.id.clone()).collect();
        let defaults = fixed.iter().map(|p| p.value).collect();
        let compartments = def.compartments.iter().map(|c| c.id.clone()).collect();
        let model = Self {
            states,
            parameters,
            defaults,
            compartments,
            sizes,
            assignments,
            fluxes,
            stoichiometry,
            rules,
            routes,
            outputs,
            definition: def,
        };
        tracing::debug!(
            model = %model.id(),
            states = model.nstates(),
            parameters = model.parameters.len(),
            "compiled model"
        );
        Ok(model)
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// The canonical definition the model was compiled from
    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub fn states(&self) -> &[StateVariable] {
        &self.states
    }

    pub fn nstates(&self) -> usize {
        self.states.len()
    }

    pub fn state_names(&self) -> Vec<String> {
        self.states.iter().map(|s| s.id.clone()).collect()
    }

    pub fn state_index(&self, id: &str) -> Option<usize> {
        self.states.iter().position(|s| s.id == id)
    }

    /// Names of the free parameters, in parameter-vector order
    pub fn parameter_names(&self) -> &[String] {
        &self.parameters
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p == name)
    }

    /// Declared parameter values
    pub fn default_parameters(&self) -> Vec<f64> {
        self.defaults.clone()
    }

    pub fn compartment_names(&self) -> &[String] {
        &self.compartments
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn route_index(&self, id: &str) -> Option<usize> {
        self.routes.iter().position(|r| r.id == id)
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn nonnegative_mask(&self) -> Vec<bool> {
        self.states.iter().map(|s| s.nonnegative).collect()
    }

    /// Compartment sizes at time `t`
    pub fn volumes(&self, t: f64, params: &[f64]) -> Vec<f64> {
        let frame = Frame {
            t,
            x: &[],
            p: params,
            volumes: &[],
            assigned: &[],
        };
        self.sizes.iter().map(|s| s.eval(&frame)).collect()
    }

    fn assigned(&self, t: f64, x: &[f64], params: &[f64], volumes: &[f64]) -> Vec<f64> {
        let mut assigned = Vec::with_capacity(self.assignments.len());
        for node in &self.assignments {
            let frame = Frame {
                t,
                x,
                p: params,
                volumes,
                assigned: &assigned,
            };
            let value = node.eval(&frame);
            assigned.push(value);
        }
        assigned
    }

    /// Initial amounts for a parameter vector, with concentrations converted
    /// using the compartment sizes at `t0`
    pub fn initial_state(&self, params: &[f64], t0: f64) -> Vec<f64> {
        let volumes = self.volumes(t0, params);
        self.states
            .iter()
            .map(|s| match s.initial {
                InitialValue::Amount(a) => a,
                InitialValue::Concentration { value, compartment } => value * volumes[compartment],
            })
            .collect()
    }

    /// Amount added to the route's target state for a dose of `amount`
    pub fn dose_delta(&self, route: usize, amount: f64, params: &[f64]) -> (usize, f64) {
        let route = &self.routes[route];
        let factor = route.factor.as_ref().map_or(1.0, |f| {
            f.eval(&Frame {
                t: 0.0,
                x: &[],
                p: params,
                volumes: &[],
                assigned: &[],
            })
        });
        (route.state, amount * factor)
    }

    /// Time derivative of every state, written into `dx`
    pub fn derivatives_into(&self, t: f64, x: &[f64], params: &[f64], dx: &mut [f64]) {
        let volumes = self.volumes(t, params);
        let assigned = self.assigned(t, x, params, &volumes);
        let frame = Frame {
            t,
            x,
            p: params,
            volumes: &volumes,
            assigned: &assigned,
        };
        dx.iter_mut().for_each(|d| *d = 0.0);
        for (flux, terms) in self.fluxes.iter().zip(&self.stoichiometry) {
            let v = flux.eval(&frame);
            for &(state, coef) in terms {
                dx[state] += coef * v;
            }
        }
        for (state, rule) in &self.rules {
            dx[*state] += rule.eval(&frame);
        }
    }

    pub fn derivatives(&self, t: f64, x: &[f64], params: &[f64]) -> Vec<f64> {
        let mut dx = vec![0.0; self.nstates()];
        self.derivatives_into(t, x, params, &mut dx);
        dx
    }

    /// Values of the declared outputs
    pub fn evaluate_outputs(&self, t: f64, x: &[f64], params: &[f64]) -> Vec<f64> {
        let volumes = self.volumes(t, params);
        let assigned = self.assigned(t, x, params, &volumes);
        let frame = Frame {
            t,
            x,
            p: params,
            volumes: &volumes,
            assigned: &assigned,
        };
        self.outputs.iter().map(|(_, node)| node.eval(&frame)).collect()
    }
}
