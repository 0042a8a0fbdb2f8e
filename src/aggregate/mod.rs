//! Derived pharmacokinetic quantities from sampled trajectories.
//!
//! Aggregation works only on what the integrator recorded; nothing is
//! re-integrated and nothing is random, so identical results always produce
//! identical tables.

pub mod auc;
pub mod table;
pub mod terminal;

use serde::{Deserialize, Serialize};

use crate::error::PbpkError;
use crate::simulator::SimulationResult;
pub use auc::{auc_all, auc_inf, auc_last, auc_segment, AUCMethod};
pub use table::{ResultTable, SummaryRow, TaskRecord};
pub use terminal::{lambda_z, LambdaZOptions, LambdaZResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateOptions {
    pub auc_method: AUCMethod,
    pub lambda_z: LambdaZOptions,
    /// Series to summarise. Empty means every model output, or every state
    /// when the model declares no outputs.
    pub observables: Vec<String>,
    /// Series that measure the dosed substance and so get CL and Vd. Empty
    /// means the states doses were applied to.
    pub dosed_observables: Vec<String>,
}

impl AggregateOptions {
    pub fn with_auc_method(mut self, method: AUCMethod) -> Self {
        self.auc_method = method;
        self
    }

    pub fn with_lambda_z(mut self, options: LambdaZOptions) -> Self {
        self.lambda_z = options;
        self
    }

    pub fn with_observables<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.observables = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dosed_observables<S: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.dosed_observables = names.into_iter().map(Into::into).collect();
        self
    }

    /// Dose attributed to `observable`; zero for series of anything else,
    /// such as metabolites
    pub fn dose_for(&self, result: &SimulationResult, observable: &str) -> f64 {
        let dosed: &[String] = if self.dosed_observables.is_empty() {
            result.dosed_states()
        } else {
            &self.dosed_observables
        };
        if dosed.iter().any(|d| d == observable) {
            result.total_dose()
        } else {
            0.0
        }
    }

    /// Observables summarised for `result`
    pub fn observables_of(&self, result: &SimulationResult) -> Vec<String> {
        if !self.observables.is_empty() {
            self.observables.clone()
        } else if !result.output_names().is_empty() {
            result.output_names().to_vec()
        } else {
            result.state_names().to_vec()
        }
    }
}

/// Summary statistics of one sampled series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PkSummary {
    pub cmax: f64,
    pub tmax: f64,
    /// Last strictly positive sample; the final sample when none is positive
    pub clast: f64,
    pub tlast: f64,
    /// Area over every sample
    pub auc: f64,
    pub aucinf: Option<f64>,
    /// Terminal rate constant λz
    pub kel: Option<f64>,
    pub thalf: Option<f64>,
    /// Clearance, `dose / aucinf`
    pub cl: Option<f64>,
    /// Volume of distribution, `cl / kel`
    pub vd: Option<f64>,
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Summarise one series; `None` when nothing was sampled
pub fn summarize(
    times: &[f64],
    values: &[f64],
    dose: f64,
    options: &AggregateOptions,
) -> Option<PkSummary> {
    if times.is_empty() || times.len() != values.len() {
        return None;
    }

    // first occurrence of the maximum
    let mut tmax_idx = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[tmax_idx] {
            tmax_idx = i;
        }
    }
    let tlast_idx = values
        .iter()
        .rposition(|&c| c > 0.0)
        .unwrap_or(values.len() - 1);

    let auc = auc_all(times, values, options.auc_method);
    let fit = lambda_z(times, values, tmax_idx, tlast_idx, &options.lambda_z);
    let kel = fit.as_ref().map(|f| f.lambda_z);
    let aucinf = kel
        .map(|k| auc_inf(auc_last(times, values, options.auc_method), values[tlast_idx], k))
        .and_then(finite);
    let cl = match aucinf {
        Some(a) if dose > 0.0 && a > 0.0 => Some(dose / a),
        _ => None,
    };
    let vd = cl.zip(kel).map(|(cl, k)| cl / k).and_then(finite);

    Some(PkSummary {
        cmax: values[tmax_idx],
        tmax: times[tmax_idx],
        clast: values[tlast_idx],
        tlast: times[tlast_idx],
        auc,
        aucinf,
        kel,
        thalf: fit.map(|f| f.half_life),
        cl,
        vd,
    })
}

/// Build the result table of a scan.
///
/// Every task gets one summary row per observable. Tasks that did not
/// complete keep their status and carry no values.
pub fn aggregate(
    results: &[SimulationResult],
    options: &AggregateOptions,
) -> Result<ResultTable, PbpkError> {
    let mut table = ResultTable::default();
    for result in results {
        let identity = result.identity();
        let observables = options.observables_of(result);
        for name in &observables {
            let Some(series) = result.series(name) else {
                return Err(PbpkError::scenario(
                    &identity.scenario,
                    format!("unknown observable '{}'", name),
                ));
            };
            let pk = if result.is_completed() {
                let values = series.to_vec();
                summarize(result.times(), &values, options.dose_for(result, name), options)
            } else {
                None
            };
            table.push_row(SummaryRow {
                task: identity.clone(),
                status: result.status().clone(),
                observable: Some(name.clone()),
                pk,
            });
        }
        if observables.is_empty() {
            table.push_row(SummaryRow {
                task: identity.clone(),
                status: result.status().clone(),
                observable: None,
                pk: None,
            });
        }
        table.push_record(TaskRecord::from_result(result))?;
    }
    tracing::debug!(
        tasks = results.len(),
        rows = table.rows().len(),
        "aggregated results"
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn decay(k: f64, dose: f64, volume: f64) -> (Vec<f64>, Vec<f64>) {
        let times: Vec<f64> = (0..=48).map(|i| i as f64 * 0.5).collect();
        let values = times
            .iter()
            .map(|t| dose / volume * (-k * t).exp())
            .collect();
        (times, values)
    }

    #[test]
    fn test_iv_bolus_summary() {
        let (k, dose, volume) = (0.2, 100.0, 10.0);
        let (times, values) = decay(k, dose, volume);
        let s = summarize(&times, &values, dose, &AggregateOptions::default()).unwrap();

        assert_relative_eq!(s.cmax, 10.0);
        assert_eq!(s.tmax, 0.0);
        assert_eq!(s.tlast, 24.0);
        assert_relative_eq!(s.kel.unwrap(), k, max_relative = 1e-8);
        assert_relative_eq!(s.aucinf.unwrap(), dose / volume / k, max_relative = 1e-8);
        assert_relative_eq!(s.cl.unwrap(), k * volume, max_relative = 1e-8);
        assert_relative_eq!(s.vd.unwrap(), volume, max_relative = 1e-8);
        assert_relative_eq!(s.thalf.unwrap(), std::f64::consts::LN_2 / k, max_relative = 1e-8);
    }

    #[test]
    fn test_undosed_has_no_clearance() {
        let (times, values) = decay(0.2, 100.0, 10.0);
        let s = summarize(&times, &values, 0.0, &AggregateOptions::default()).unwrap();
        assert!(s.kel.is_some());
        assert!(s.cl.is_none());
        assert!(s.vd.is_none());
    }

    #[test]
    fn test_flat_series() {
        let times = vec![0.0, 1.0, 2.0];
        let s = summarize(&times, &[0.0; 3], 1.0, &AggregateOptions::default()).unwrap();
        assert_eq!(s.cmax, 0.0);
        assert_eq!(s.auc, 0.0);
        assert!(s.kel.is_none());
        assert!(summarize(&[], &[], 1.0, &AggregateOptions::default()).is_none());
    }
}
