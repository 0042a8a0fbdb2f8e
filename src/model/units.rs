//! Unit strings, physical dimensions and dimensional inference over expressions.
//!
//! Only dimensions are checked; scales are carried so that two spellings of
//! the same unit (`mmol`, `mmole`) compare equal during composition.

use super::expr::{is_time_symbol, BinaryOp, Expr, UnaryOp};
use cached::proc_macro::cached;
use cached::UnboundCache;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt;

/// Exponents of (substance, mass, length, time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dimension(pub [i32; 4]);

impl Dimension {
    pub const DIMENSIONLESS: Dimension = Dimension([0, 0, 0, 0]);
    pub const SUBSTANCE: Dimension = Dimension([1, 0, 0, 0]);
    pub const MASS: Dimension = Dimension([0, 1, 0, 0]);
    pub const LENGTH: Dimension = Dimension([0, 0, 1, 0]);
    pub const AREA: Dimension = Dimension([0, 0, 2, 0]);
    pub const VOLUME: Dimension = Dimension([0, 0, 3, 0]);
    pub const TIME: Dimension = Dimension([0, 0, 0, 1]);

    pub fn product(self, other: Dimension) -> Dimension {
        let mut out = self.0;
        out.iter_mut().zip(other.0).for_each(|(a, b)| *a += b);
        Dimension(out)
    }

    pub fn quotient(self, other: Dimension) -> Dimension {
        self.product(other.powi(-1))
    }

    pub fn powi(self, n: i32) -> Dimension {
        Dimension(self.0.map(|e| e * n))
    }

    /// Square root, if every exponent is even
    pub fn sqrt(self) -> Option<Dimension> {
        if self.0.iter().all(|e| e % 2 == 0) {
            Some(Dimension(self.0.map(|e| e / 2)))
        } else {
            None
        }
    }

    pub fn is_dimensionless(&self) -> bool {
        *self == Self::DIMENSIONLESS
    }

    /// Volume, area or length
    pub fn is_extent(&self) -> bool {
        matches!(*self, Self::VOLUME | Self::AREA | Self::LENGTH)
    }

    /// Substance or mass
    pub fn is_quantity(&self) -> bool {
        matches!(*self, Self::SUBSTANCE | Self::MASS)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dimensionless() {
            return write!(f, "dimensionless");
        }
        let names = ["substance", "mass", "length", "time"];
        let parts: Vec<String> = names
            .iter()
            .zip(self.0)
            .filter(|(_, e)| *e != 0)
            .map(|(n, e)| if e == 1 { n.to_string() } else { format!("{}^{}", n, e) })
            .collect();
        write!(f, "{}", parts.join("*"))
    }
}

/// A parsed unit: dimension plus scale relative to SI base units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unit {
    pub dimension: Dimension,
    pub scale: f64,
}

impl Unit {
    const fn new(dimension: Dimension, scale: f64) -> Self {
        Self { dimension, scale }
    }

    /// Same dimension and scale, up to rounding
    pub fn equivalent(&self, other: &Unit) -> bool {
        self.dimension == other.dimension
            && ((self.scale - other.scale).abs() <= 1e-12 * self.scale.abs().max(other.scale.abs()))
    }
}

lazy_static! {
    static ref BASE_UNITS: HashMap<&'static str, Unit> = {
        let d = Dimension::DIMENSIONLESS;
        let n = Dimension::SUBSTANCE;
        let m = Dimension::MASS;
        let l = Dimension::LENGTH;
        let v = Dimension::VOLUME;
        let t = Dimension::TIME;
        let molar = n.quotient(v);
        let entries = vec![
            ("dimensionless", Unit::new(d, 1.0)),
            ("-", Unit::new(d, 1.0)),
            ("mole", Unit::new(n, 1.0)),
            ("mol", Unit::new(n, 1.0)),
            ("mmole", Unit::new(n, 1e-3)),
            ("mmol", Unit::new(n, 1e-3)),
            ("umole", Unit::new(n, 1e-6)),
            ("umol", Unit::new(n, 1e-6)),
            ("nmole", Unit::new(n, 1e-9)),
            ("nmol", Unit::new(n, 1e-9)),
            ("g", Unit::new(m, 1.0)),
            ("kg", Unit::new(m, 1e3)),
            ("mg", Unit::new(m, 1e-3)),
            ("ug", Unit::new(m, 1e-6)),
            ("ng", Unit::new(m, 1e-9)),
            ("l", Unit::new(v, 1e-3)),
            ("L", Unit::new(v, 1e-3)),
            ("litre", Unit::new(v, 1e-3)),
            ("liter", Unit::new(v, 1e-3)),
            ("dl", Unit::new(v, 1e-4)),
            ("ml", Unit::new(v, 1e-6)),
            ("ul", Unit::new(v, 1e-9)),
            ("m", Unit::new(l, 1.0)),
            ("cm", Unit::new(l, 1e-2)),
            ("mm", Unit::new(l, 1e-3)),
            ("um", Unit::new(l, 1e-6)),
            ("s", Unit::new(t, 1.0)),
            ("sec", Unit::new(t, 1.0)),
            ("min", Unit::new(t, 60.0)),
            ("h", Unit::new(t, 3600.0)),
            ("hr", Unit::new(t, 3600.0)),
            ("hour", Unit::new(t, 3600.0)),
            ("day", Unit::new(t, 86400.0)),
            ("d", Unit::new(t, 86400.0)),
            ("week", Unit::new(t, 604800.0)),
            ("M", Unit::new(molar, 1e3)),
            ("mM", Unit::new(molar, 1.0)),
            ("uM", Unit::new(molar, 1e-3)),
            ("nM", Unit::new(molar, 1e-6)),
        ];
        entries.into_iter().collect()
    };
}

fn parse_factor(factor: &str) -> Result<Unit, String> {
    let factor = factor.trim();
    if factor.is_empty() {
        return Err("empty unit factor".to_string());
    }
    if let Ok(value) = factor.parse::<f64>() {
        return Ok(Unit::new(Dimension::DIMENSIONLESS, value));
    }
    let (name, exponent) = match factor.split_once('^') {
        Some((name, exp)) => (
            name,
            exp.trim()
                .parse::<i32>()
                .map_err(|_| format!("invalid exponent in '{}'", factor))?,
        ),
        None => {
            let stem = factor.trim_end_matches(|c: char| c.is_ascii_digit());
            if stem.is_empty() || stem.len() == factor.len() {
                (factor, 1)
            } else {
                let exp = factor[stem.len()..]
                    .parse::<i32>()
                    .map_err(|_| format!("invalid exponent in '{}'", factor))?;
                (stem, exp)
            }
        }
    };
    let base = BASE_UNITS
        .get(name.trim())
        .ok_or_else(|| format!("unknown unit '{}'", name.trim()))?;
    Ok(Unit::new(
        base.dimension.powi(exponent),
        base.scale.powi(exponent),
    ))
}

/// Parse a unit string such as `mmole/min/l`, `1/min` or `m^2`
#[cached(
    ty = "UnboundCache<String, Unit>",
    create = "{ UnboundCache::new() }",
    convert = r#"{ text.trim().to_string() }"#,
    result = "true"
)]
pub fn parse_unit(text: &str) -> Result<Unit, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty unit".to_string());
    }
    let mut unit = Unit::new(Dimension::DIMENSIONLESS, 1.0);
    let mut divide = false;
    let mut factor = String::new();
    for c in text.chars().chain(std::iter::once('*')) {
        if c == '*' || c == '/' {
            let parsed = parse_factor(&factor)?;
            unit = if divide {
                Unit::new(unit.dimension.quotient(parsed.dimension), unit.scale / parsed.scale)
            } else {
                Unit::new(unit.dimension.product(parsed.dimension), unit.scale * parsed.scale)
            };
            divide = c == '/';
            factor.clear();
        } else {
            factor.push(c);
        }
    }
    Ok(unit)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Inference
// ═══════════════════════════════════════════════════════════════════════════════

/// Inferred dimension of an expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dim {
    /// Built from numeric literals only; adopts whatever it is combined with
    Free,
    /// Depends on a symbol without a declared unit
    Unknown,
    Known(Dimension),
}

impl Dim {
    fn combine_mul(self, other: Dim, f: impl Fn(Dimension, Dimension) -> Dimension) -> Dim {
        match (self, other) {
            (Dim::Unknown, _) | (_, Dim::Unknown) => Dim::Unknown,
            (Dim::Free, Dim::Free) => Dim::Free,
            (Dim::Known(a), Dim::Free) => Dim::Known(f(a, Dimension::DIMENSIONLESS)),
            (Dim::Free, Dim::Known(b)) => Dim::Known(f(Dimension::DIMENSIONLESS, b)),
            (Dim::Known(a), Dim::Known(b)) => Dim::Known(f(a, b)),
        }
    }

    fn unify(self, other: Dim, context: &str) -> Result<Dim, String> {
        match (self, other) {
            (Dim::Known(a), Dim::Known(b)) if a != b => Err(format!(
                "incompatible dimensions in {}: {} vs {}",
                context, a, b
            )),
            (Dim::Known(a), _) | (_, Dim::Known(a)) => Ok(Dim::Known(a)),
            (Dim::Unknown, _) | (_, Dim::Unknown) => Ok(Dim::Unknown),
            _ => Ok(Dim::Free),
        }
    }

    fn require_dimensionless(self, context: &str) -> Result<(), String> {
        match self {
            Dim::Known(d) if !d.is_dimensionless() => Err(format!(
                "argument of {} must be dimensionless, found {}",
                context, d
            )),
            _ => Ok(()),
        }
    }
}

fn constant_integer(expr: &Expr) -> Option<i32> {
    let value = match expr {
        Expr::Number(v) => *v,
        Expr::Unary {
            op: UnaryOp::Neg,
            rhs,
        } => match rhs.as_ref() {
            Expr::Number(v) => -*v,
            _ => return None,
        },
        _ => return None,
    };
    (value.fract() == 0.0).then_some(value as i32)
}

fn infer_power(base: Dim, exponent: &Expr, exp_dim: Dim) -> Result<Dim, String> {
    exp_dim.require_dimensionless("an exponent")?;
    Ok(match base {
        Dim::Known(d) if d.is_dimensionless() => Dim::Known(d),
        Dim::Known(d) => match constant_integer(exponent) {
            Some(n) => Dim::Known(d.powi(n)),
            None => Dim::Unknown,
        },
        other => other,
    })
}

/// Infer the dimension of `expr`; `lookup` gives the dimension of a symbol
pub fn infer(expr: &Expr, lookup: &impl Fn(&str) -> Dim) -> Result<Dim, String> {
    Ok(match expr {
        Expr::Number(_) => Dim::Free,
        Expr::Ident(name) if is_time_symbol(name) => Dim::Known(Dimension::TIME),
        Expr::Ident(name) => lookup(name),
        Expr::Unary { op, rhs } => {
            let inner = infer(rhs, lookup)?;
            match op {
                UnaryOp::Neg => inner,
                UnaryOp::Not => Dim::Known(Dimension::DIMENSIONLESS),
            }
        }
        Expr::Binary { lhs, op, rhs } => {
            let a = infer(lhs, lookup)?;
            let b = infer(rhs, lookup)?;
            match op {
                BinaryOp::Add | BinaryOp::Sub => a.unify(b, &expr.to_string())?,
                BinaryOp::Mul => a.combine_mul(b, Dimension::product),
                BinaryOp::Div => a.combine_mul(b, Dimension::quotient),
                BinaryOp::Pow => infer_power(a, rhs, b)?,
                BinaryOp::And | BinaryOp::Or => Dim::Known(Dimension::DIMENSIONLESS),
                op if op.is_comparison() => {
                    a.unify(b, &expr.to_string())?;
                    Dim::Known(Dimension::DIMENSIONLESS)
                }
                _ => Dim::Unknown,
            }
        }
        Expr::Call { name, args } => {
            let dims = args
                .iter()
                .map(|a| infer(a, lookup))
                .collect::<Result<Vec<_>, _>>()?;
            match (name.as_str(), dims.as_slice()) {
                ("exp" | "ln" | "log" | "log10", [arg]) => {
                    arg.require_dimensionless(name)?;
                    Dim::Known(Dimension::DIMENSIONLESS)
                }
                ("sqrt", [arg]) => match arg {
                    Dim::Known(d) => d.sqrt().map(Dim::Known).unwrap_or(Dim::Unknown),
                    other => *other,
                },
                ("pow" | "powf", [base, exp]) => infer_power(*base, &args[1], *exp)?,
                ("abs" | "floor" | "ceil", [arg]) => *arg,
                ("min" | "max", [first, rest @ ..]) => rest
                    .iter()
                    .try_fold(*first, |acc, d| acc.unify(*d, name))?,
                _ => Dim::Unknown,
            }
        }
        Expr::Ternary {
            cond,
            then_branch,
            else_branch,
        } => {
            infer(cond, lookup)?;
            let a = infer(then_branch, lookup)?;
            let b = infer(else_branch, lookup)?;
            a.unify(b, "conditional branches")?
        }
    })
}
