//! Structural and dimensional validation of model definitions

use std::collections::{HashMap, HashSet};

use super::expr::{is_time_symbol, parse_expression, Expr, Func};
use super::types::*;
use super::units::{infer, parse_unit, Dim, Dimension};
use crate::error::PbpkError;

/// How strictly states without a rate equation are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// A fragment meant for composition; port species may be driven by
    /// equations contributed by other submodels
    Submodel,
    /// A complete model about to be simulated
    Model,
}

/// A model definition that passed every check
///
/// Carries the evaluation order of the assignments so that compilation does
/// not have to sort them again.
#[derive(Debug, Clone)]
pub struct ValidatedModel {
    definition: ModelDefinition,
    assignment_order: Vec<usize>,
}

impl ValidatedModel {
    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub fn into_inner(self) -> ModelDefinition {
        self.definition
    }

    /// Indices into `definition().assignments`, dependencies first
    pub fn assignment_order(&self) -> &[usize] {
        &self.assignment_order
    }
}

/// Validator for model definitions
pub struct Validator {
    mode: ValidationMode,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidationMode::Model)
    }
}

/// Expressions of a model, parsed once
struct Parsed {
    sizes: Vec<Option<Expr>>,
    assignments: Vec<Expr>,
    reactions: Vec<Expr>,
    rate_rules: Vec<Expr>,
    route_factors: Vec<Option<Expr>>,
}

fn is_identifier(id: &str) -> bool {
    let mut chars = id.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn called_functions(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Number(_) | Expr::Ident(_) => {}
        Expr::Unary { rhs, .. } => called_functions(rhs, out),
        Expr::Binary { lhs, rhs, .. } => {
            called_functions(lhs, out);
            called_functions(rhs, out);
        }
        Expr::Call { name, args } => {
            out.push(name.clone());
            args.iter().for_each(|a| called_functions(a, out));
        }
        Expr::Ternary {
            cond,
            then_branch,
            else_branch,
        } => {
            called_functions(cond, out);
            called_functions(then_branch, out);
            called_functions(else_branch, out);
        }
    }
}

impl Validator {
    pub fn new(mode: ValidationMode) -> Self {
        Self { mode }
    }

    pub fn submodel() -> Self {
        Self::new(ValidationMode::Submodel)
    }

    /// Validate a model definition
    pub fn validate(&self, model: &ModelDefinition) -> Result<ValidatedModel, PbpkError> {
        // 1. Schema and identifiers
        self.validate_header(model)?;
        self.validate_identifiers(model)?;

        // 2. Parse every expression
        let parsed = self.parse_expressions(model)?;

        // 3. Symbol references
        self.validate_references(model, &parsed)?;

        // 4. Rate equations for every state
        self.validate_rate_equations(model)?;

        // 5. Assignment ordering
        let assignment_order = self.assignment_order(model, &parsed)?;

        // 6. Routes and outputs
        self.validate_routes(model)?;
        self.validate_outputs(model)?;

        // 7. Units
        self.validate_units(model, &parsed, &assignment_order)?;

        Ok(ValidatedModel {
            definition: model.clone(),
            assignment_order,
        })
    }

    fn validate_header(&self, model: &ModelDefinition) -> Result<(), PbpkError> {
        let major = model.schema.split('.').next().unwrap_or_default();
        if major != SCHEMA_VERSION.split('.').next().unwrap_or_default() {
            return Err(PbpkError::parse(
                &model.id,
                format!(
                    "unsupported schema version '{}', expected {}",
                    model.schema, SCHEMA_VERSION
                ),
            ));
        }
        if model.id.trim().is_empty() {
            return Err(PbpkError::parse("<unnamed>", "model id must not be empty"));
        }
        Ok(())
    }

    fn validate_identifiers(&self, model: &ModelDefinition) -> Result<(), PbpkError> {
        let symbols = model
            .compartments
            .iter()
            .map(|c| &c.id)
            .chain(model.species.iter().map(|s| &s.id))
            .chain(model.parameters.iter().map(|p| &p.id))
            .chain(model.assignments.iter().map(|a| &a.id));

        let mut seen = HashSet::new();
        for id in symbols {
            if !is_identifier(id) {
                return Err(PbpkError::parse(
                    &model.id,
                    format!("'{}' is not a valid identifier", id),
                ));
            }
            if is_time_symbol(id) {
                return Err(PbpkError::validation(
                    &model.id,
                    format!("'{}' is reserved for model time", id),
                ));
            }
            if !seen.insert(id.as_str()) {
                return Err(PbpkError::validation(
                    &model.id,
                    format!("symbol '{}' is declared more than once", id),
                ));
            }
        }

        let mut reactions = HashSet::new();
        for r in &model.reactions {
            if !reactions.insert(r.id.as_str()) {
                return Err(PbpkError::validation(
                    &model.id,
                    format!("reaction '{}' is declared more than once", r.id),
                ));
            }
        }
        let mut routes = HashSet::new();
        for r in &model.routes {
            if !routes.insert(r.id.as_str()) {
                return Err(PbpkError::validation(
                    &model.id,
                    format!("route '{}' is declared more than once", r.id),
                ));
            }
        }
        Ok(())
    }

    fn parse_expressions(&self, model: &ModelDefinition) -> Result<Parsed, PbpkError> {
        let parse = |what: &str, e: &Expression| {
            parse_expression(e.as_str()).map_err(|err| {
                PbpkError::parse(&model.id, format!("{} '{}': {}", what, e, err))
            })
        };
        Ok(Parsed {
            sizes: model
                .compartments
                .iter()
                .map(|c| {
                    c.size
                        .as_expression()
                        .map(|e| parse(&format!("size of '{}'", c.id), e))
                        .transpose()
                })
                .collect::<Result<_, _>>()?,
            assignments: model
                .assignments
                .iter()
                .map(|a| parse(&format!("assignment '{}'", a.id), &a.expression))
                .collect::<Result<_, _>>()?,
            reactions: model
                .reactions
                .iter()
                .map(|r| parse(&format!("rate of reaction '{}'", r.id), &r.rate))
                .collect::<Result<_, _>>()?,
            rate_rules: model
                .rate_rules
                .iter()
                .map(|r| parse(&format!("rate rule for '{}'", r.target), &r.expression))
                .collect::<Result<_, _>>()?,
            route_factors: model
                .routes
                .iter()
                .map(|r| {
                    r.factor
                        .as_ref()
                        .map(|e| parse(&format!("factor of route '{}'", r.id), e))
                        .transpose()
                })
                .collect::<Result<_, _>>()?,
        })
    }

    fn validate_references(
        &self,
        model: &ModelDefinition,
        parsed: &Parsed,
    ) -> Result<(), PbpkError> {
        for s in &model.species {
            if !model.compartments.iter().any(|c| c.id == s.compartment) {
                return Err(PbpkError::validation(
                    &model.id,
                    format!(
                        "species '{}' lives in undefined compartment '{}'",
                        s.id, s.compartment
                    ),
                ));
            }
        }

        for r in &model.reactions {
            for species in r.equation.species() {
                if model.kind_of(species) != Some(SymbolKind::Species) {
                    return Err(PbpkError::validation(
                        &model.id,
                        format!("reaction '{}' references unknown species '{}'", r.id, species),
                    ));
                }
            }
        }

        let state_parameters: HashSet<&str> = model
            .rate_rules
            .iter()
            .map(|r| r.target.as_str())
            .filter(|t| model.kind_of(t) == Some(SymbolKind::Parameter))
            .collect();

        let check = |what: String, expr: &Expr, allowed: &dyn Fn(&str) -> bool| {
            let mut functions = Vec::new();
            called_functions(expr, &mut functions);
            if let Some(f) = functions.iter().find(|f| Func::lookup(f).is_none()) {
                return Err(PbpkError::validation(
                    &model.id,
                    format!("{} calls unknown function '{}'", what, f),
                ));
            }
            for id in expr.identifiers() {
                if is_time_symbol(&id) {
                    continue;
                }
                if model.kind_of(&id).is_none() {
                    return Err(PbpkError::validation(
                        &model.id,
                        format!("{} references undefined symbol '{}'", what, id),
                    ));
                }
                if !allowed(&id) {
                    return Err(PbpkError::validation(
                        &model.id,
                        format!("{} may not reference '{}'", what, id),
                    ));
                }
            }
            Ok(())
        };

        let any = |_: &str| true;
        let fixed_parameter = |id: &str| {
            model.kind_of(id) == Some(SymbolKind::Parameter) && !state_parameters.contains(id)
        };

        for (c, size) in model.compartments.iter().zip(&parsed.sizes) {
            if let Some(expr) = size {
                check(format!("size of compartment '{}'", c.id), expr, &fixed_parameter)?;
            }
        }
        for (a, expr) in model.assignments.iter().zip(&parsed.assignments) {
            check(format!("assignment '{}'", a.id), expr, &any)?;
        }
        for (r, expr) in model.reactions.iter().zip(&parsed.reactions) {
            check(format!("reaction '{}'", r.id), expr, &any)?;
        }
        for (r, expr) in model.rate_rules.iter().zip(&parsed.rate_rules) {
            check(format!("rate rule for '{}'", r.target), expr, &any)?;
        }
        for (r, factor) in model.routes.iter().zip(&parsed.route_factors) {
            if let Some(expr) = factor {
                check(format!("factor of route '{}'", r.id), expr, &fixed_parameter)?;
            }
        }
        Ok(())
    }

    fn validate_rate_equations(&self, model: &ModelDefinition) -> Result<(), PbpkError> {
        let mut ruled = HashSet::new();
        for rule in &model.rate_rules {
            match model.kind_of(&rule.target) {
                Some(SymbolKind::Species) | Some(SymbolKind::Parameter) => {}
                Some(kind) => {
                    return Err(PbpkError::validation(
                        &model.id,
                        format!(
                            "rate rule targets {} '{}'; only species and parameters can be states",
                            kind, rule.target
                        ),
                    ))
                }
                None => {
                    return Err(PbpkError::validation(
                        &model.id,
                        format!("rate rule targets undefined symbol '{}'", rule.target),
                    ))
                }
            }
            if !ruled.insert(rule.target.as_str()) {
                return Err(PbpkError::validation(
                    &model.id,
                    format!("'{}' has more than one rate rule", rule.target),
                ));
            }
        }

        for s in &model.species {
            let in_reaction = model
                .reactions
                .iter()
                .flat_map(|r| r.equation.net_stoichiometry())
                .any(|(id, coef)| id == s.id && coef != 0.0);
            let has_rule = ruled.contains(s.id.as_str());

            if s.constant && has_rule {
                return Err(PbpkError::validation(
                    &model.id,
                    format!("constant species '{}' has a rate rule", s.id),
                ));
            }
            if s.constant {
                continue;
            }
            if in_reaction && has_rule {
                return Err(PbpkError::validation(
                    &model.id,
                    format!(
                        "species '{}' is changed by both reactions and a rate rule",
                        s.id
                    ),
                ));
            }
            let exempt = self.mode == ValidationMode::Submodel && s.port;
            if !in_reaction && !has_rule && !exempt {
                return Err(PbpkError::validation(
                    &model.id,
                    format!(
                        "species '{}' is neither constant nor changed by a reaction or rate rule",
                        s.id
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Order assignments so that every assignment follows its dependencies
    ///
    /// Among the ready assignments the earliest declared one is taken, which
    /// keeps the order stable for acyclic inputs.
    fn assignment_order(
        &self,
        model: &ModelDefinition,
        parsed: &Parsed,
    ) -> Result<Vec<usize>, PbpkError> {
        let index: HashMap<&str, usize> = model
            .assignments
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.as_str(), i))
            .collect();
        let deps: Vec<Vec<usize>> = parsed
            .assignments
            .iter()
            .map(|expr| {
                expr.identifiers()
                    .iter()
                    .filter_map(|id| index.get(id.as_str()).copied())
                    .collect()
            })
            .collect();

        let n = model.assignments.len();
        let mut done = vec![false; n];
        let mut order = Vec::with_capacity(n);
        while order.len() < n {
            let next = (0..n).find(|&i| !done[i] && deps[i].iter().all(|&d| done[d]));
            match next {
                Some(i) => {
                    done[i] = true;
                    order.push(i);
                }
                None => {
                    let cycle: Vec<&str> = (0..n)
                        .filter(|&i| !done[i])
                        .map(|i| model.assignments[i].id.as_str())
                        .collect();
                    return Err(PbpkError::validation(
                        &model.id,
                        format!("cyclic assignments: {}", cycle.join(", ")),
                    ));
                }
            }
        }
        Ok(order)
    }

    fn validate_routes(&self, model: &ModelDefinition) -> Result<(), PbpkError> {
        for route in &model.routes {
            let target = model.species.iter().find(|s| s.id == route.target);
            match target {
                Some(s) if !s.constant => {}
                Some(_) => {
                    return Err(PbpkError::validation(
                        &model.id,
                        format!("route '{}' doses into constant species '{}'", route.id, route.target),
                    ))
                }
                None => {
                    return Err(PbpkError::validation(
                        &model.id,
                        format!("route '{}' targets unknown species '{}'", route.id, route.target),
                    ))
                }
            }
        }
        Ok(())
    }

    fn validate_outputs(&self, model: &ModelDefinition) -> Result<(), PbpkError> {
        let mut seen = HashSet::new();
        for output in &model.outputs {
            if model.kind_of(output).is_none() {
                return Err(PbpkError::validation(
                    &model.id,
                    format!("output '{}' is not a declared symbol", output),
                ));
            }
            if !seen.insert(output.as_str()) {
                return Err(PbpkError::validation(
                    &model.id,
                    format!("output '{}' is listed twice", output),
                ));
            }
        }
        Ok(())
    }

    fn validate_units(
        &self,
        model: &ModelDefinition,
        parsed: &Parsed,
        assignment_order: &[usize],
    ) -> Result<(), PbpkError> {
        let unit = |text: &str, owner: &str| {
            parse_unit(text).map_err(|e| {
                PbpkError::validation(&model.id, format!("unit of '{}': {}", owner, e))
            })
        };

        let time = unit(&model.units.time, "model time")?;
        let substance = unit(&model.units.substance, "model substance")?;
        let volume = unit(&model.units.volume, "model volume")?;
        if time.dimension != Dimension::TIME
            || !substance.dimension.is_quantity()
            || volume.dimension != Dimension::VOLUME
        {
            return Err(PbpkError::validation(
                &model.id,
                "model units must be a time, a substance and a volume",
            ));
        }

        let mut dims: HashMap<&str, Dim> = HashMap::new();
        let mut quantity: HashMap<&str, Dimension> = HashMap::new();

        for c in &model.compartments {
            let d = match &c.unit {
                Some(u) => unit(u, &c.id)?.dimension,
                None => volume.dimension,
            };
            if !d.is_extent() {
                return Err(PbpkError::validation(
                    &model.id,
                    format!("compartment '{}' must be a volume, area or length, found {}", c.id, d),
                ));
            }
            dims.insert(&c.id, Dim::Known(d));
        }
        for s in &model.species {
            let q = match &s.unit {
                Some(u) => unit(u, &s.id)?.dimension,
                None => substance.dimension,
            };
            if !q.is_quantity() {
                return Err(PbpkError::validation(
                    &model.id,
                    format!("species '{}' must be a substance or mass, found {}", s.id, q),
                ));
            }
            quantity.insert(&s.id, q);
            let symbol = if s.amount_only {
                Dim::Known(q)
            } else {
                match dims.get(s.compartment.as_str()) {
                    Some(Dim::Known(c)) => Dim::Known(q.quotient(*c)),
                    _ => Dim::Unknown,
                }
            };
            dims.insert(&s.id, symbol);
        }
        for p in &model.parameters {
            let d = match &p.unit {
                Some(u) => Dim::Known(unit(u, &p.id)?.dimension),
                None => Dim::Unknown,
            };
            dims.insert(&p.id, d);
        }

        let mismatch = |what: String, expected: Dimension, found: Dimension| {
            PbpkError::validation(
                &model.id,
                format!("{} has dimension {}, expected {}", what, found, expected),
            )
        };
        let infer_in = |what: &str, expr: &Expr, dims: &HashMap<&str, Dim>| {
            let lookup = |id: &str| dims.get(id).copied().unwrap_or(Dim::Unknown);
            infer(expr, &lookup)
                .map_err(|e| PbpkError::validation(&model.id, format!("{}: {}", what, e)))
        };

        for &i in assignment_order {
            let a = &model.assignments[i];
            let what = format!("assignment '{}'", a.id);
            let inferred = infer_in(&what, &parsed.assignments[i], &dims)?;
            let declared = a.unit.as_deref().map(|u| unit(u, &a.id)).transpose()?;
            let d = match (declared, inferred) {
                (Some(u), Dim::Known(found)) if u.dimension != found => {
                    return Err(mismatch(what, u.dimension, found))
                }
                (Some(u), _) => Dim::Known(u.dimension),
                (None, inferred) => inferred,
            };
            dims.insert(&a.id, d);
        }

        for (c, size) in model.compartments.iter().zip(&parsed.sizes) {
            let (Some(expr), Some(Dim::Known(expected))) = (size, dims.get(c.id.as_str())) else {
                continue;
            };
            let what = format!("size of compartment '{}'", c.id);
            if let Dim::Known(found) = infer_in(&what, expr, &dims)? {
                if found != *expected {
                    return Err(mismatch(what, *expected, found));
                }
            }
        }

        for (r, expr) in model.reactions.iter().zip(&parsed.reactions) {
            let mut species = r.equation.species();
            let first = species.next().and_then(|s| quantity.get(s.as_str())).copied();
            let q = first.unwrap_or(Dimension::SUBSTANCE);
            if species.any(|s| quantity.get(s.as_str()) != Some(&q)) {
                return Err(PbpkError::validation(
                    &model.id,
                    format!("reaction '{}' mixes substance and mass species", r.id),
                ));
            }
            let what = format!("rate of reaction '{}'", r.id);
            let expected = q.quotient(Dimension::TIME);
            if let Dim::Known(found) = infer_in(&what, expr, &dims)? {
                if found != expected {
                    return Err(mismatch(what, expected, found));
                }
            }
        }

        for (rule, expr) in model.rate_rules.iter().zip(&parsed.rate_rules) {
            let target = match quantity.get(rule.target.as_str()) {
                Some(q) => Dim::Known(*q),
                None => dims.get(rule.target.as_str()).copied().unwrap_or(Dim::Unknown),
            };
            let what = format!("rate rule for '{}'", rule.target);
            let found = infer_in(&what, expr, &dims)?;
            if let (Dim::Known(target), Dim::Known(found)) = (target, found) {
                let expected = target.quotient(Dimension::TIME);
                if found != expected {
                    return Err(mismatch(what, expected, found));
                }
            }
        }
        Ok(())
    }
}
