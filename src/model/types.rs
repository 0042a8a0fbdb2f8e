//! Serde types for the JSON model exchange format

use serde::{Deserialize, Serialize};
use std::fmt;

pub const SCHEMA_VERSION: &str = "1.0";

fn default_schema() -> String {
    SCHEMA_VERSION.to_string()
}

fn default_true() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// Expressions
// ═══════════════════════════════════════════════════════════════════════════════

/// A rate-law or rule expression in infix notation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Expression(pub String);

impl Expression {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for Expression {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Expression {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Either a numeric constant or an expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpressionOrNumber {
    Number(f64),
    Expression(Expression),
}

impl ExpressionOrNumber {
    pub fn as_expression(&self) -> Option<&Expression> {
        match self {
            Self::Number(_) => None,
            Self::Expression(e) => Some(e),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Model
// ═══════════════════════════════════════════════════════════════════════════════

/// Base units of a model; every undeclared unit falls back to these
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUnits {
    pub time: String,
    pub substance: String,
    pub volume: String,
}

impl Default for ModelUnits {
    fn default() -> Self {
        Self {
            time: "min".to_string(),
            substance: "mmole".to_string(),
            volume: "l".to_string(),
        }
    }
}

/// A complete model definition as read from a model file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub units: ModelUnits,
    #[serde(default)]
    pub compartments: Vec<CompartmentDef>,
    #[serde(default)]
    pub species: Vec<SpeciesDef>,
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
    #[serde(default)]
    pub assignments: Vec<AssignmentDef>,
    #[serde(default)]
    pub reactions: Vec<ReactionDef>,
    #[serde(default, rename = "rateRules", alias = "rate_rules")]
    pub rate_rules: Vec<RateRuleDef>,
    #[serde(default)]
    pub routes: Vec<RouteDef>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl ModelDefinition {
    /// Symbol kind of `id`, if declared
    pub fn kind_of(&self, id: &str) -> Option<SymbolKind> {
        if self.compartments.iter().any(|c| c.id == id) {
            Some(SymbolKind::Compartment)
        } else if self.species.iter().any(|s| s.id == id) {
            Some(SymbolKind::Species)
        } else if self.parameters.iter().any(|p| p.id == id) {
            Some(SymbolKind::Parameter)
        } else if self.assignments.iter().any(|a| a.id == id) {
            Some(SymbolKind::Assignment)
        } else {
            None
        }
    }

    /// Ids of every symbol flagged as a port
    pub fn ports(&self) -> Vec<String> {
        let compartments = self.compartments.iter().filter(|c| c.port).map(|c| &c.id);
        let species = self.species.iter().filter(|s| s.port).map(|s| &s.id);
        let parameters = self.parameters.iter().filter(|p| p.port).map(|p| &p.id);
        compartments
            .chain(species)
            .chain(parameters)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Compartment,
    Species,
    Parameter,
    Assignment,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compartment => write!(f, "compartment"),
            Self::Species => write!(f, "species"),
            Self::Parameter => write!(f, "parameter"),
            Self::Assignment => write!(f, "assignment"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompartmentDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Volume (or area/length) of the compartment, possibly time-varying
    pub size: ExpressionOrNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub port: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub compartment: String,
    #[serde(
        default,
        rename = "initialAmount",
        alias = "initial_amount",
        skip_serializing_if = "Option::is_none"
    )]
    pub initial_amount: Option<f64>,
    #[serde(
        default,
        rename = "initialConcentration",
        alias = "initial_concentration",
        skip_serializing_if = "Option::is_none"
    )]
    pub initial_concentration: Option<f64>,
    /// Substance unit of the amount
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// When true the symbol denotes the amount, otherwise the concentration
    #[serde(default, rename = "amountOnly", alias = "amount_only")]
    pub amount_only: bool,
    #[serde(default)]
    pub constant: bool,
    #[serde(default = "default_true")]
    pub nonnegative: bool,
    #[serde(default)]
    pub port: bool,
}

impl SpeciesDef {
    /// Initial value in the species' own terms (amount or concentration)
    pub fn initial_value(&self) -> f64 {
        if self.amount_only {
            self.initial_amount.unwrap_or(0.0)
        } else {
            self.initial_concentration.unwrap_or(0.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub port: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentDef {
    pub id: String,
    pub expression: Expression,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub equation: ReactionEquation,
    /// Reaction flux in substance per time
    pub rate: Expression,
}

/// A rate rule; targets a species or turns a parameter into a state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateRuleDef {
    pub target: String,
    pub expression: Expression,
}

/// A dosing route: scenario amounts are multiplied by `factor` and added to `target`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDef {
    pub id: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<Expression>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reaction equations
// ═══════════════════════════════════════════════════════════════════════════════

/// Stoichiometric equation such as `"2 A + B -> C"` or `"A <-> B"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReactionEquation {
    pub reactants: Vec<(f64, String)>,
    pub products: Vec<(f64, String)>,
    pub reversible: bool,
}

impl ReactionEquation {
    pub fn species(&self) -> impl Iterator<Item = &String> {
        self.reactants
            .iter()
            .chain(self.products.iter())
            .map(|(_, s)| s)
    }

    /// Net stoichiometric coefficient per species, in first-seen order
    pub fn net_stoichiometry(&self) -> Vec<(String, f64)> {
        let mut net: Vec<(String, f64)> = Vec::new();
        let terms = self
            .reactants
            .iter()
            .map(|(c, s)| (-c, s))
            .chain(self.products.iter().map(|(c, s)| (*c, s)));
        for (coef, species) in terms {
            match net.iter_mut().find(|(s, _)| s == species) {
                Some((_, c)) => *c += coef,
                None => net.push((species.clone(), coef)),
            }
        }
        net
    }

    pub fn rename(&mut self, rename: &impl Fn(&str) -> String) {
        for (_, s) in self.reactants.iter_mut().chain(self.products.iter_mut()) {
            *s = rename(s);
        }
    }
}

fn parse_side(side: &str) -> Result<Vec<(f64, String)>, String> {
    let side = side.trim();
    if side.is_empty() {
        return Ok(Vec::new());
    }
    side.split('+')
        .map(|term| {
            let parts: Vec<&str> = term.split_whitespace().collect();
            match parts.as_slice() {
                [species] => Ok((1.0, species.to_string())),
                [coef, species] => coef
                    .parse::<f64>()
                    .map(|c| (c, species.to_string()))
                    .map_err(|_| format!("invalid stoichiometric coefficient '{}'", coef)),
                _ => Err(format!("invalid reaction term '{}'", term.trim())),
            }
        })
        .collect()
}

impl TryFrom<String> for ReactionEquation {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (lhs, rhs, reversible) = if let Some((l, r)) = value.split_once("<->") {
            (l, r, true)
        } else if let Some((l, r)) = value.split_once("<=>") {
            (l, r, true)
        } else if let Some((l, r)) = value.split_once("->") {
            (l, r, false)
        } else if let Some((l, r)) = value.split_once("=>") {
            (l, r, false)
        } else {
            return Err(format!("reaction equation '{}' has no arrow", value));
        };
        let reactants = parse_side(lhs)?;
        let products = parse_side(rhs)?;
        if reactants.is_empty() && products.is_empty() {
            return Err(format!("reaction equation '{}' is empty", value));
        }
        Ok(Self {
            reactants,
            products,
            reversible,
        })
    }
}

impl From<ReactionEquation> for String {
    fn from(eq: ReactionEquation) -> Self {
        eq.to_string()
    }
}

impl fmt::Display for ReactionEquation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |terms: &[(f64, String)]| {
            terms
                .iter()
                .map(|(c, s)| {
                    if *c == 1.0 {
                        s.clone()
                    } else {
                        format!("{} {}", c, s)
                    }
                })
                .collect::<Vec<_>>()
                .join(" + ")
        };
        let arrow = if self.reversible { "<->" } else { "->" };
        write!(f, "{} {} {}", side(&self.reactants), arrow, side(&self.products))
    }
}
