//! Terminal phase: λz and half-life
//!
//! Candidate point sets run backwards from the last positive sample. Each is
//! fitted by ordinary least squares on ln(C) against time; the accepted fit
//! with the best adjusted R² wins, preferring more points when two fits are
//! within `r_squared_tolerance`.

use serde::{Deserialize, Serialize};

/// Accepted terminal-phase regression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaZResult {
    /// Terminal elimination rate constant (1/time)
    pub lambda_z: f64,
    pub half_life: f64,
    pub r_squared: f64,
    pub adj_r_squared: f64,
    pub n_points: usize,
    pub time_first: f64,
    pub time_last: f64,
    /// Regression time span over half-life
    pub span_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LambdaZOptions {
    pub min_points: usize,
    /// Let the sample at Tmax take part in the regression
    pub allow_tmax: bool,
    pub min_r_squared: f64,
    pub min_span_ratio: f64,
    pub r_squared_tolerance: f64,
}

impl Default for LambdaZOptions {
    fn default() -> Self {
        Self {
            min_points: 3,
            allow_tmax: false,
            min_r_squared: 0.9,
            min_span_ratio: 2.0,
            r_squared_tolerance: 1e-4,
        }
    }
}

impl LambdaZOptions {
    pub fn with_min_points(mut self, min_points: usize) -> Self {
        self.min_points = min_points;
        self
    }

    pub fn with_min_r_squared(mut self, min_r_squared: f64) -> Self {
        self.min_r_squared = min_r_squared;
        self
    }

    pub fn with_min_span_ratio(mut self, min_span_ratio: f64) -> Self {
        self.min_span_ratio = min_span_ratio;
        self
    }

    pub fn with_allow_tmax(mut self, allow_tmax: bool) -> Self {
        self.allow_tmax = allow_tmax;
        self
    }
}

/// Estimate λz from the samples between `tmax_idx` and `tlast_idx`
pub fn lambda_z(
    times: &[f64],
    values: &[f64],
    tmax_idx: usize,
    tlast_idx: usize,
    options: &LambdaZOptions,
) -> Option<LambdaZResult> {
    if times.len() != values.len() || tlast_idx >= times.len() {
        return None;
    }
    let min_points = options.min_points.max(2);
    let start_idx = if options.allow_tmax { 0 } else { tmax_idx + 1 };
    if tlast_idx + 1 < start_idx + min_points {
        return None;
    }

    let mut best: Option<LambdaZResult> = None;
    for n in min_points..=(tlast_idx + 1 - start_idx) {
        let first_idx = tlast_idx + 1 - n;
        let (x, y): (Vec<f64>, Vec<f64>) = (first_idx..=tlast_idx)
            .filter(|&i| values[i] > 0.0)
            .map(|i| (times[i], values[i].ln()))
            .unzip();
        if x.len() < min_points {
            continue;
        }
        let Some((slope, _, r_squared)) = linear_regression(&x, &y) else {
            continue;
        };
        let lambda = -slope;
        if lambda <= 0.0 || r_squared < options.min_r_squared {
            continue;
        }

        let half_life = std::f64::consts::LN_2 / lambda;
        let span = x[x.len() - 1] - x[0];
        let k = x.len() as f64;
        let adj_r_squared = if x.len() > 2 {
            1.0 - (1.0 - r_squared) * (k - 1.0) / (k - 2.0)
        } else {
            r_squared
        };
        let candidate = LambdaZResult {
            lambda_z: lambda,
            half_life,
            r_squared,
            adj_r_squared,
            n_points: x.len(),
            time_first: x[0],
            time_last: x[x.len() - 1],
            span_ratio: span / half_life,
        };

        best = match best {
            None => Some(candidate),
            Some(current) => {
                let diff = candidate.adj_r_squared - current.adj_r_squared;
                if diff > options.r_squared_tolerance
                    || (diff >= -options.r_squared_tolerance
                        && candidate.n_points > current.n_points)
                {
                    Some(candidate)
                } else {
                    Some(current)
                }
            }
        };
    }

    best.filter(|b| b.span_ratio >= options.min_span_ratio)
}

/// Ordinary least squares; returns slope, intercept and R²
fn linear_regression(x: &[f64], y: &[f64]) -> Option<(f64, f64, f64)> {
    let n = x.len();
    if n < 2 || n != y.len() {
        return None;
    }
    let x_mean = x.iter().sum::<f64>() / n as f64;
    let y_mean = y.iter().sum::<f64>() / n as f64;

    let (mut ss_xy, mut ss_xx, mut ss_yy) = (0.0, 0.0, 0.0);
    for (xi, yi) in x.iter().zip(y) {
        let dx = xi - x_mean;
        let dy = yi - y_mean;
        ss_xy += dx * dy;
        ss_xx += dx * dx;
        ss_yy += dy * dy;
    }
    if ss_xx.abs() < 1e-15 {
        return None;
    }
    let slope = ss_xy / ss_xx;
    let r_squared = if ss_yy.abs() < 1e-15 {
        1.0
    } else {
        (ss_xy * ss_xy) / (ss_xx * ss_yy)
    };
    Some((slope, y_mean - slope * x_mean, r_squared))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_exact_exponential() {
        let k = 0.25;
        let times: Vec<f64> = (0..=24).map(|i| i as f64).collect();
        let values: Vec<f64> = times.iter().map(|t| 10.0 * (-k * t).exp()).collect();
        let fit = lambda_z(&times, &values, 0, 24, &LambdaZOptions::default()).unwrap();
        assert_relative_eq!(fit.lambda_z, k, max_relative = 1e-10);
        assert_relative_eq!(fit.half_life, std::f64::consts::LN_2 / k, max_relative = 1e-10);
        // every point after tmax
        assert_eq!(fit.n_points, 24);
    }

    #[test]
    fn test_prefers_terminal_phase() {
        // fast distribution phase followed by slow elimination
        let times: Vec<f64> = (0..=30).map(|i| i as f64).collect();
        let values: Vec<f64> = times
            .iter()
            .map(|t| 50.0 * (-2.0 * t).exp() + 5.0 * (-0.1 * t).exp())
            .collect();
        let fit = lambda_z(&times, &values, 0, 30, &LambdaZOptions::default()).unwrap();
        assert_relative_eq!(fit.lambda_z, 0.1, max_relative = 1e-2);
    }

    #[test]
    fn test_rejections() {
        let times = vec![0.0, 1.0, 2.0, 3.0];
        let rising = vec![1.0, 2.0, 3.0, 4.0];
        assert!(lambda_z(&times, &rising, 0, 3, &LambdaZOptions::default().with_allow_tmax(true)).is_none());

        let short = vec![4.0, 2.0];
        assert!(lambda_z(&times[..2], &short, 0, 1, &LambdaZOptions::default()).is_none());

        // one half-life spanned is not enough
        let times: Vec<f64> = vec![0.0, 0.5, 1.0, 1.5];
        let values: Vec<f64> = times.iter().map(|t| (-0.1 * t).exp()).collect();
        assert!(lambda_z(&times, &values, 0, 3, &LambdaZOptions::default()).is_none());
    }
}
