//! Value sets used in scenarios: parameter overrides and timepoint grids

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    #[default]
    Linear,
    Log,
}

/// `num` points between `start` and `end` (inclusive), plus extra values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub start: f64,
    pub end: f64,
    pub num: usize,
    #[serde(default)]
    pub scale: Scale,
    /// Values appended to the grid, typically the reference value
    #[serde(default)]
    pub include: Vec<f64>,
}

impl Range {
    pub fn values(&self) -> Result<Vec<f64>, String> {
        if !self.start.is_finite() || !self.end.is_finite() {
            return Err("range bounds must be finite".to_string());
        }
        let mut values = match (self.num, self.scale) {
            (0, _) => Vec::new(),
            (1, _) => vec![self.start],
            (n, Scale::Linear) => {
                let step = (self.end - self.start) / (n - 1) as f64;
                (0..n).map(|i| self.start + step * i as f64).collect()
            }
            (n, Scale::Log) => {
                if self.start <= 0.0 || self.end <= 0.0 {
                    return Err("log-scaled range needs positive bounds".to_string());
                }
                let (a, b) = (self.start.log10(), self.end.log10());
                let step = (b - a) / (n - 1) as f64;
                (0..n).map(|i| 10f64.powf(a + step * i as f64)).collect()
            }
        };
        values.extend(self.include.iter().copied());
        values.sort_by(f64::total_cmp);
        values.dedup();
        if values.is_empty() {
            return Err("range produces no values".to_string());
        }
        Ok(values)
    }
}

/// The value set of one overridden parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OverrideValues {
    Single(f64),
    List(Vec<f64>),
    Range { range: Range },
}

impl OverrideValues {
    pub fn values(&self) -> Result<Vec<f64>, String> {
        let values = match self {
            Self::Single(v) => vec![*v],
            Self::List(v) => v.clone(),
            Self::Range { range } => range.values()?,
        };
        if values.is_empty() {
            return Err("empty value set".to_string());
        }
        if let Some(v) = values.iter().find(|v| !v.is_finite()) {
            return Err(format!("non-finite value {}", v));
        }
        Ok(values)
    }
}

impl From<f64> for OverrideValues {
    fn from(v: f64) -> Self {
        Self::Single(v)
    }
}

impl From<Vec<f64>> for OverrideValues {
    fn from(v: Vec<f64>) -> Self {
        Self::List(v)
    }
}

/// Output times, either listed or as an evenly spaced grid of `steps + 1` points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timepoints {
    List(Vec<f64>),
    Grid { start: f64, end: f64, steps: usize },
}

impl Timepoints {
    pub fn values(&self) -> Vec<f64> {
        match self {
            Self::List(v) => v.clone(),
            Self::Grid { start, end, steps } => {
                if *steps == 0 {
                    return vec![*start];
                }
                let dt = (end - start) / *steps as f64;
                (0..=*steps).map(|i| start + dt * i as f64).collect()
            }
        }
    }
}

impl Default for Timepoints {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_range_with_reference() {
        let range = Range {
            start: 0.5,
            end: 2.0,
            num: 4,
            scale: Scale::Linear,
            include: vec![1.0, 2.0],
        };
        assert_eq!(range.values().unwrap(), vec![0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_log_range() {
        let range = Range {
            start: 0.1,
            end: 10.0,
            num: 3,
            scale: Scale::Log,
            include: vec![],
        };
        let v = range.values().unwrap();
        assert_eq!(v.len(), 3);
        assert_relative_eq!(v[0], 0.1, epsilon = 1e-12);
        assert_relative_eq!(v[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(v[2], 10.0, epsilon = 1e-12);

        let bad = Range { start: 0.0, ..range };
        assert!(bad.values().is_err());
    }

    #[test]
    fn test_override_forms() {
        let v: OverrideValues = serde_json::from_str("3.0").unwrap();
        assert_eq!(v.values().unwrap(), vec![3.0]);
        let v: OverrideValues = serde_json::from_str("[1, 2]").unwrap();
        assert_eq!(v.values().unwrap(), vec![1.0, 2.0]);
        let v: OverrideValues =
            serde_json::from_str(r#"{"range": {"start": 1, "end": 3, "num": 3}}"#).unwrap();
        assert_eq!(v.values().unwrap(), vec![1.0, 2.0, 3.0]);
        let v: OverrideValues = serde_json::from_str("[]").unwrap();
        assert!(v.values().is_err());
    }

    #[test]
    fn test_grid() {
        let grid: Timepoints =
            serde_json::from_str(r#"{"start": 0, "end": 1440, "steps": 4}"#).unwrap();
        assert_eq!(grid.values(), vec![0.0, 360.0, 720.0, 1080.0, 1440.0]);
    }
}
