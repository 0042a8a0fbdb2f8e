//! Flattening of independently defined submodels into one model.
//!
//! Local symbols are prefixed with the submodel namespace (`LI__rap`), shared
//! symbols listed in the [`CompositionMap`] are unified under their shared
//! name, and rate rules that target the same shared symbol are summed. The
//! result is canonicalised (every collection sorted by id), so the outcome
//! depends neither on the order of the submodels nor on how the merge is
//! grouped.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::expr::{parse_expression, Expr};
use super::types::*;
use super::units::parse_unit;
use super::validation::Validator;
use super::CompartmentalModel;
use crate::error::PbpkError;

/// Separator between namespace and local symbol
pub const NAMESPACE_SEPARATOR: &str = "__";

/// A model fragment plus the symbols it exposes to other submodels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submodel {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub definition: ModelDefinition,
    pub ports: Vec<String>,
}

impl Submodel {
    /// Validate `definition` as a fragment and collect its ports
    pub fn new(
        id: impl Into<String>,
        namespace: Option<String>,
        definition: ModelDefinition,
    ) -> Result<Self, PbpkError> {
        Validator::submodel().validate(&definition)?;
        let ports = definition.ports();
        Ok(Self {
            id: id.into(),
            namespace,
            definition,
            ports,
        })
    }

    fn local_name(&self, symbol: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}{}{}", ns, NAMESPACE_SEPARATOR, symbol),
            None => symbol.to_string(),
        }
    }
}

/// A symbol of one submodel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    pub submodel: String,
    pub symbol: String,
}

/// Ports of several submodels that denote one shared symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub shared: String,
    pub members: Vec<PortRef>,
}

/// Boundary correspondences between submodels
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositionMap(pub Vec<Correspondence>);

impl CompositionMap {
    pub fn new(correspondences: Vec<Correspondence>) -> Self {
        Self(correspondences)
    }

    /// Keep only members that belong to the given submodels, dropping
    /// correspondences that end up empty
    pub fn restricted_to(&self, submodels: &[&str]) -> Self {
        Self(
            self.0
                .iter()
                .filter_map(|c| {
                    let members: Vec<PortRef> = c
                        .members
                        .iter()
                        .filter(|m| submodels.contains(&m.submodel.as_str()))
                        .cloned()
                        .collect();
                    (!members.is_empty()).then(|| Correspondence {
                        shared: c.shared.clone(),
                        members,
                    })
                })
                .collect(),
        )
    }
}

#[derive(Debug, Clone)]
enum Item {
    Compartment(CompartmentDef),
    Species(SpeciesDef),
    Parameter(ParameterDef),
    Assignment(AssignmentDef),
}

impl Item {
    fn kind(&self) -> SymbolKind {
        match self {
            Item::Compartment(_) => SymbolKind::Compartment,
            Item::Species(_) => SymbolKind::Species,
            Item::Parameter(_) => SymbolKind::Parameter,
            Item::Assignment(_) => SymbolKind::Assignment,
        }
    }
}

fn same_unit(symbol: &str, a: &Option<String>, b: &Option<String>) -> Result<bool, PbpkError> {
    match (a, b) {
        (None, None) => Ok(true),
        (Some(a), Some(b)) => {
            let ua = parse_unit(a).map_err(|e| PbpkError::conflict(symbol, e))?;
            let ub = parse_unit(b).map_err(|e| PbpkError::conflict(symbol, e))?;
            Ok(ua.equivalent(&ub))
        }
        _ => Ok(false),
    }
}

/// Check that two definitions of one shared symbol agree, returning the
/// merged definition
fn merge_shared(name: &str, existing: &Item, incoming: &Item) -> Result<Item, PbpkError> {
    let conflict = |what: &str| Err(PbpkError::conflict(name, format!("{} differ", what)));
    match (existing, incoming) {
        (Item::Species(a), Item::Species(b)) => {
            if !same_unit(name, &a.unit, &b.unit)? {
                return conflict("units");
            }
            if a.amount_only != b.amount_only {
                return conflict("amount/concentration semantics");
            }
            if a.initial_amount != b.initial_amount
                || a.initial_concentration != b.initial_concentration
            {
                return conflict("initial values");
            }
            if a.compartment != b.compartment {
                return conflict("compartments");
            }
            if a.constant != b.constant {
                return conflict("constant flags");
            }
            let mut merged = a.clone();
            merged.nonnegative = a.nonnegative || b.nonnegative;
            Ok(Item::Species(merged))
        }
        (Item::Compartment(a), Item::Compartment(b)) => {
            if !same_unit(name, &a.unit, &b.unit)? {
                return conflict("units");
            }
            if a.size != b.size {
                return conflict("sizes");
            }
            Ok(existing.clone())
        }
        (Item::Parameter(a), Item::Parameter(b)) => {
            if !same_unit(name, &a.unit, &b.unit)? {
                return conflict("units");
            }
            if a.value != b.value {
                return conflict("values");
            }
            Ok(existing.clone())
        }
        (a, b) => Err(PbpkError::conflict(
            name,
            format!("shared as both {} and {}", a.kind(), b.kind()),
        )),
    }
}

fn renamed_expression(
    source: &Expression,
    rename: &impl Fn(&str) -> String,
    owner: &str,
) -> Result<Expr, PbpkError> {
    let mut expr = parse_expression(source.as_str())
        .map_err(|e| PbpkError::parse(owner, format!("'{}': {}", source, e)))?;
    expr.rename(rename);
    Ok(expr)
}

/// Flatten `submodels` into a single canonical model definition
pub fn compose_definitions(
    id: &str,
    submodels: &[Submodel],
    map: &CompositionMap,
) -> Result<ModelDefinition, PbpkError> {
    let mut ordered: Vec<&Submodel> = submodels.iter().collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));
    for pair in ordered.windows(2) {
        if pair[0].id == pair[1].id {
            return Err(PbpkError::conflict(
                &pair[0].id,
                "submodel id used more than once",
            ));
        }
    }
    let first = ordered
        .first()
        .ok_or_else(|| PbpkError::conflict(id, "nothing to compose"))?;

    let time = parse_unit(&first.definition.units.time).map_err(|e| PbpkError::conflict("time", e))?;
    for sub in &ordered {
        let t = parse_unit(&sub.definition.units.time).map_err(|e| PbpkError::conflict("time", e))?;
        if !t.equivalent(&time) {
            return Err(PbpkError::conflict(
                "time",
                format!("submodel '{}' uses a different time unit", sub.id),
            ));
        }
    }

    // (submodel, symbol) -> shared name
    let mut shared_of: HashMap<PortRef, String> = HashMap::new();
    let mut shared_names = HashSet::new();
    for c in &map.0 {
        if !shared_names.insert(c.shared.clone()) {
            return Err(PbpkError::conflict(&c.shared, "shared name declared twice"));
        }
        for m in &c.members {
            let sub = ordered
                .iter()
                .find(|s| s.id == m.submodel)
                .ok_or_else(|| {
                    PbpkError::conflict(&c.shared, format!("unknown submodel '{}'", m.submodel))
                })?;
            if !sub.ports.contains(&m.symbol) {
                return Err(PbpkError::conflict(
                    &c.shared,
                    format!("'{}' is not a port of submodel '{}'", m.symbol, m.submodel),
                ));
            }
            if shared_of.insert(m.clone(), c.shared.clone()).is_some() {
                return Err(PbpkError::conflict(
                    &c.shared,
                    format!("'{}' of '{}' is mapped twice", m.symbol, m.submodel),
                ));
            }
        }
    }

    let mut symbols: BTreeMap<String, (String, Item)> = BTreeMap::new();
    let mut reactions: BTreeMap<String, ReactionDef> = BTreeMap::new();
    let mut rules: BTreeMap<String, Vec<Expr>> = BTreeMap::new();
    let mut routes: BTreeMap<String, RouteDef> = BTreeMap::new();
    let mut outputs: Vec<String> = Vec::new();

    for sub in &ordered {
        let def = &sub.definition;
        let names: HashMap<String, String> = def
            .compartments
            .iter()
            .map(|c| &c.id)
            .chain(def.species.iter().map(|s| &s.id))
            .chain(def.parameters.iter().map(|p| &p.id))
            .chain(def.assignments.iter().map(|a| &a.id))
            .map(|symbol| {
                let key = PortRef {
                    submodel: sub.id.clone(),
                    symbol: symbol.clone(),
                };
                let name = shared_of
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| sub.local_name(symbol));
                (symbol.clone(), name)
            })
            .collect();
        let rename = |s: &str| names.get(s).cloned().unwrap_or_else(|| s.to_string());

        let mut items = Vec::new();
        for c in &def.compartments {
            let size = match &c.size {
                ExpressionOrNumber::Number(v) => ExpressionOrNumber::Number(*v),
                ExpressionOrNumber::Expression(e) => ExpressionOrNumber::Expression(
                    renamed_expression(e, &rename, &sub.id)?.to_string().into(),
                ),
            };
            items.push(Item::Compartment(CompartmentDef {
                id: rename(&c.id),
                size,
                unit: Some(c.unit.clone().unwrap_or_else(|| def.units.volume.clone())),
                ..c.clone()
            }));
        }
        for s in &def.species {
            items.push(Item::Species(SpeciesDef {
                id: rename(&s.id),
                compartment: rename(&s.compartment),
                unit: Some(s.unit.clone().unwrap_or_else(|| def.units.substance.clone())),
                ..s.clone()
            }));
        }
        for p in &def.parameters {
            items.push(Item::Parameter(ParameterDef {
                id: rename(&p.id),
                ..p.clone()
            }));
        }
        for a in &def.assignments {
            items.push(Item::Assignment(AssignmentDef {
                id: rename(&a.id),
                expression: renamed_expression(&a.expression, &rename, &sub.id)?
                    .to_string()
                    .into(),
                unit: a.unit.clone(),
            }));
        }

        for item in items {
            let name = match &item {
                Item::Compartment(c) => c.id.clone(),
                Item::Species(s) => s.id.clone(),
                Item::Parameter(p) => p.id.clone(),
                Item::Assignment(a) => a.id.clone(),
            };
            match symbols.get(&name) {
                None => {
                    let item = match item {
                        Item::Compartment(mut c) if shared_names.contains(&name) => {
                            c.port = true;
                            Item::Compartment(c)
                        }
                        Item::Species(mut s) if shared_names.contains(&name) => {
                            s.port = true;
                            Item::Species(s)
                        }
                        Item::Parameter(mut p) if shared_names.contains(&name) => {
                            p.port = true;
                            Item::Parameter(p)
                        }
                        other => other,
                    };
                    symbols.insert(name, (sub.id.clone(), item));
                }
                Some((_, existing)) if shared_names.contains(&name) => {
                    let merged = merge_shared(&name, existing, &item)?;
                    if let Some(entry) = symbols.get_mut(&name) {
                        entry.1 = merged;
                    }
                }
                Some((origin, _)) => {
                    return Err(PbpkError::conflict(
                        &name,
                        format!(
                            "defined by both '{}' and '{}' without a correspondence",
                            origin, sub.id
                        ),
                    ));
                }
            }
        }

        for r in &def.reactions {
            let rid = sub.local_name(&r.id);
            let mut equation = r.equation.clone();
            equation.rename(&rename);
            let reaction = ReactionDef {
                id: rid.clone(),
                name: r.name.clone(),
                equation,
                rate: renamed_expression(&r.rate, &rename, &sub.id)?
                    .to_string()
                    .into(),
            };
            if reactions.insert(rid.clone(), reaction).is_some() {
                return Err(PbpkError::conflict(&rid, "reaction id collides"));
            }
        }

        for rule in &def.rate_rules {
            rules
                .entry(rename(&rule.target))
                .or_default()
                .push(renamed_expression(&rule.expression, &rename, &sub.id)?);
        }

        for route in &def.routes {
            let renamed = RouteDef {
                id: route.id.clone(),
                target: rename(&route.target),
                factor: route
                    .factor
                    .as_ref()
                    .map(|f| renamed_expression(f, &rename, &sub.id).map(|e| e.to_string().into()))
                    .transpose()?,
            };
            if routes.insert(route.id.clone(), renamed).is_some() {
                return Err(PbpkError::conflict(
                    &route.id,
                    "dosing route defined by more than one submodel",
                ));
            }
        }

        outputs.extend(def.outputs.iter().map(|o| rename(o)));
    }

    // A shared species cannot be driven by both reactions and rate rules
    for target in rules.keys() {
        let in_reaction = reactions.values().any(|r| {
            r.equation
                .net_stoichiometry()
                .iter()
                .any(|(s, c)| s == target && *c != 0.0)
        });
        if in_reaction {
            return Err(PbpkError::conflict(
                target,
                "changed by reactions in one submodel and a rate rule in another",
            ));
        }
    }

    outputs.sort();
    outputs.dedup();

    let mut definition = ModelDefinition {
        schema: SCHEMA_VERSION.to_string(),
        id: id.to_string(),
        name: None,
        units: first.definition.units.clone(),
        compartments: Vec::new(),
        species: Vec::new(),
        parameters: Vec::new(),
        assignments: Vec::new(),
        reactions: reactions.into_values().collect(),
        rate_rules: rules
            .into_iter()
            .filter_map(|(target, exprs)| {
                Expr::sum(exprs).map(|sum| RateRuleDef {
                    target,
                    expression: sum.to_string().into(),
                })
            })
            .collect(),
        routes: routes.into_values().collect(),
        outputs,
    };
    for (_, (_, item)) in symbols {
        match item {
            Item::Compartment(c) => definition.compartments.push(c),
            Item::Species(s) => definition.species.push(s),
            Item::Parameter(p) => definition.parameters.push(p),
            Item::Assignment(a) => definition.assignments.push(a),
        }
    }

    Validator::submodel().validate(&definition)?;
    tracing::info!(
        model = %id,
        submodels = ordered.len(),
        shared = shared_names.len(),
        species = definition.species.len(),
        "composed submodels"
    );
    Ok(definition)
}

/// Flatten `submodels` and compile the result into a simulatable model
pub fn compose(
    id: &str,
    submodels: &[Submodel],
    map: &CompositionMap,
) -> Result<CompartmentalModel, PbpkError> {
    CompartmentalModel::new(compose_definitions(id, submodels, map)?)
}

impl CompartmentalModel {
    /// Wrap the model as a submodel so it can take part in a further
    /// composition; its ports are the shared symbols plus any remaining ports
    pub fn to_submodel(&self, id: impl Into<String>, namespace: Option<String>) -> Submodel {
        let definition = self.definition().clone();
        let ports = definition.ports();
        Submodel {
            id: id.into(),
            namespace,
            definition,
            ports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn organ(id: &str, k: f64) -> ModelDefinition {
        serde_json::from_str(&format!(
            r#"{{
                "id": "{id}",
                "compartments": [
                    {{"id": "Vext", "size": 1.0, "port": true}},
                    {{"id": "V", "size": 0.5}}
                ],
                "species": [
                    {{"id": "c_ext", "compartment": "Vext", "initialConcentration": 1.0, "port": true}},
                    {{"id": "c", "compartment": "V", "initialConcentration": 0.0}}
                ],
                "parameters": [{{"id": "k", "value": {k}, "unit": "l/min"}}],
                "reactions": [{{"id": "uptake", "equation": "c_ext <-> c", "rate": "k * (c_ext - c)"}}]
            }}"#
        ))
        .unwrap()
    }

    fn map(subs: &[&str]) -> CompositionMap {
        let members = |symbol: &str| {
            subs.iter()
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

    fn liver() -> Submodel {
        Submodel::new("liver", Some("LI".into()), organ("liver", 0.1)).unwrap()
    }

    fn kidney() -> Submodel {
        Submodel::new("kidney", Some("KI".into()), organ("kidney", 0.2)).unwrap()
    }

    #[test]
    fn test_namespaces_and_shared_symbols() {
        let def = compose_definitions("body", &[liver(), kidney()], &map(&["liver", "kidney"])).unwrap();
        let species: Vec<&str> = def.species.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(species, vec!["KI__c", "LI__c", "c_ext"]);
        let reactions: Vec<&str> = def.reactions.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(reactions, vec!["KI__uptake", "LI__uptake"]);
        assert_eq!(def.ports(), vec!["Vext".to_string(), "c_ext".to_string()]);
    }

    #[test]
    fn test_order_independence() {
        let m = map(&["liver", "kidney"]);
        let a = compose_definitions("body", &[liver(), kidney()], &m).unwrap();
        let b = compose_definitions("body", &[kidney(), liver()], &m).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_initial_value_conflict() {
        let mut def = organ("kidney", 0.2);
        def.species[0].initial_concentration = Some(2.0);
        let kidney = Submodel::new("kidney", Some("KI".into()), def).unwrap();
        let err = compose_definitions("body", &[liver(), kidney], &map(&["liver", "kidney"])).unwrap_err();
        assert!(matches!(err, PbpkError::CompositionConflictError { .. }));
    }

    #[test]
    fn test_unit_conflict() {
        let mut def = organ("kidney", 0.2);
        def.species[0].unit = Some("umole".into());
        let kidney = Submodel::new("kidney", Some("KI".into()), def).unwrap();
        let err = compose_definitions("body", &[liver(), kidney], &map(&["liver", "kidney"])).unwrap_err();
        assert!(err.to_string().contains("units"));
    }

    #[test]
    fn test_unresolved_collision() {
        let a = Submodel::new("a", None, organ("a", 0.1)).unwrap();
        let b = Submodel::new("b", None, organ("b", 0.2)).unwrap();
        let err = compose_definitions("body", &[a, b], &CompositionMap::default()).unwrap_err();
        assert!(matches!(err, PbpkError::CompositionConflictError { .. }));
    }

    #[test]
    fn test_member_must_be_port() {
        let m = CompositionMap::new(vec![Correspondence {
            shared: "c".into(),
            members: vec![PortRef {
                submodel: "liver".into(),
                symbol: "c".into(),
            }],
        }]);
        assert!(compose_definitions("body", &[liver()], &m).is_err());
    }

    #[test]
    fn test_restricted_map() {
        let m = map(&["liver", "kidney"]).restricted_to(&["liver"]);
        assert!(m.0.iter().all(|c| c.members.len() == 1));
        let def = compose_definitions("liver_only", &[liver()], &m).unwrap();
        assert!(def.species.iter().any(|s| s.id == "c_ext"));
    }
}
