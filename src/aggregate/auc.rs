//! Area under a sampled curve
//!
//! Two quadrature rules are available:
//!
//! ```text
//! Linear:                 AUC = (C₁ + C₂) / 2 × Δt
//! Log-down (C₂ < C₁):     AUC = (C₁ - C₂) × Δt / ln(C₁ / C₂)
//! ```
//!
//! The log-linear rule integrates an exponential between the two samples and
//! is only applied to strictly positive, descending segments.

use serde::{Deserialize, Serialize};

/// Quadrature rule for AUC segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AUCMethod {
    /// Linear trapezoidal rule
    Linear,
    /// Linear for ascending segments, log-linear for descending ones
    #[default]
    LinUpLogDown,
}

/// AUC of the segment between `(t1, c1)` and `(t2, c2)`; zero if `t2 <= t1`
#[inline]
pub fn auc_segment(t1: f64, c1: f64, t2: f64, c2: f64, method: AUCMethod) -> f64 {
    let dt = t2 - t1;
    if dt <= 0.0 {
        return 0.0;
    }
    let linear = (c1 + c2) / 2.0 * dt;
    match method {
        AUCMethod::Linear => linear,
        AUCMethod::LinUpLogDown => {
            if c2 >= c1 || c1 <= 0.0 || c2 <= 0.0 {
                return linear;
            }
            let ratio = c1 / c2;
            if (ratio - 1.0).abs() < 1e-10 {
                linear
            } else {
                (c1 - c2) * dt / ratio.ln()
            }
        }
    }
}

/// AUC over the samples `0..=last`
pub fn auc_to(times: &[f64], values: &[f64], last: usize, method: AUCMethod) -> f64 {
    let last = last.min(times.len().min(values.len()).saturating_sub(1));
    (1..=last)
        .map(|i| auc_segment(times[i - 1], values[i - 1], times[i], values[i], method))
        .sum()
}

/// AUC over every sample of the series
pub fn auc_all(times: &[f64], values: &[f64], method: AUCMethod) -> f64 {
    auc_to(times, values, usize::MAX, method)
}

/// AUC up to the last strictly positive sample
pub fn auc_last(times: &[f64], values: &[f64], method: AUCMethod) -> f64 {
    match values.iter().rposition(|&c| c > 0.0) {
        Some(last) => auc_to(times, values, last, method),
        None => 0.0,
    }
}

/// AUC extrapolated to infinity; NaN unless `lambda_z` is positive
pub fn auc_inf(auc_last: f64, clast: f64, lambda_z: f64) -> f64 {
    if lambda_z <= 0.0 || !lambda_z.is_finite() {
        return f64::NAN;
    }
    auc_last + clast / lambda_z
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_auc_segment_rules() {
        assert_relative_eq!(auc_segment(0.0, 10.0, 1.0, 8.0, AUCMethod::Linear), 9.0);

        let up = auc_segment(0.0, 5.0, 1.0, 10.0, AUCMethod::LinUpLogDown);
        assert_relative_eq!(up, 7.5);

        let down = auc_segment(0.0, 10.0, 1.0, 5.0, AUCMethod::LinUpLogDown);
        assert_relative_eq!(down, 5.0 / 2.0_f64.ln());

        assert_eq!(auc_segment(2.0, 10.0, 1.0, 8.0, AUCMethod::Linear), 0.0);
        assert_eq!(auc_segment(0.0, 0.0, 1.0, 0.0, AUCMethod::LinUpLogDown), 0.0);
    }

    #[test]
    fn test_log_down_is_exact_for_exponentials() {
        let k = 0.3;
        let times: Vec<f64> = (0..=20).map(|i| i as f64).collect();
        let values: Vec<f64> = times.iter().map(|t| 4.0 * (-k * t).exp()).collect();
        let expected = 4.0 / k * (1.0 - (-k * 20.0_f64).exp());
        assert_relative_eq!(
            auc_all(&times, &values, AUCMethod::LinUpLogDown),
            expected,
            max_relative = 1e-10
        );
        // trapezoids overestimate a convex decay
        assert!(auc_all(&times, &values, AUCMethod::Linear) > expected);
    }

    #[test]
    fn test_auc_last_stops_at_last_positive() {
        let times = vec![0.0, 1.0, 2.0, 3.0];
        let values = vec![0.0, 2.0, 2.0, 0.0];
        assert_relative_eq!(auc_last(&times, &values, AUCMethod::Linear), 3.0);
        assert_relative_eq!(auc_all(&times, &values, AUCMethod::Linear), 4.0);
        assert_eq!(auc_last(&times, &[0.0; 4], AUCMethod::Linear), 0.0);
    }

    #[test]
    fn test_auc_inf() {
        assert_relative_eq!(auc_inf(10.0, 2.0, 0.5), 14.0);
        assert!(auc_inf(10.0, 2.0, 0.0).is_nan());
    }
}
