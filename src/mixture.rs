//! Module for fitting per-marker Gaussian models: a 1-component fit and a
//! 2-component mixture fit via EM, compared downstream by AIC.

use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, Normal};

/// Variance floor below which a component is considered collapsed.
const VAR_FLOOR: f64 = 1e-10;
/// Minimum effective number of events a mixture component may hold.
const MIN_COMPONENT_MASS: f64 = 1.0;
/// Relative log-likelihood change that counts as convergence.
const LL_TOL: f64 = 1e-8;

/// One Gaussian component of a fitted mixture.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GaussianComponent {
    pub mean: f64,
    pub variance: f64,
    /// Mixing weight in [0, 1]; the two components of a mixture sum to 1.
    pub weight: f64,
}

/// Maximum-likelihood single-Gaussian fit (2 free parameters).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnimodalFit {
    pub mean: f64,
    pub variance: f64,
    pub log_likelihood: f64,
    /// AIC = 2*2 - 2*logL
    pub aic: f64,
}

/// Converged (or iteration-capped) 2-component mixture fit (5 free
/// parameters: two means, two variances, one mixing weight).
#[derive(Debug, Clone)]
pub struct MixtureFit {
    /// Component with the smaller mean.
    pub low: GaussianComponent,
    /// Component with the larger mean.
    pub high: GaussianComponent,
    pub log_likelihood: f64,
    /// AIC = 2*5 - 2*logL
    pub aic: f64,
    /// Hard posterior assignment per observation, in input order.
    /// `true` means the high-mean component (ties go high).
    pub assignments: Vec<bool>,
    pub iterations: usize,
    pub converged: bool,
}

/// Outcome of fitting one marker over one group of events. The scorer
/// pattern-matches on this instead of inspecting raw parameter values.
#[derive(Debug, Clone)]
pub enum MarkerFit {
    /// Both models fit; the marker is a split candidate.
    Bimodal {
        unimodal: UnimodalFit,
        mixture: MixtureFit,
    },
    /// The mixture fit degenerated; the marker cannot discriminate here.
    Unimodal { unimodal: UnimodalFit },
    /// The data itself is flat (near-zero overall variance); no usable fit.
    Degenerate,
}

/// Fits both models for one marker. Degeneracy in the mixture fit is
/// recovered by falling back to the unimodal-only variant, never an error.
pub fn fit_marker(values: &[f64], max_em_iter: usize) -> MarkerFit {
    let unimodal = match fit_unimodal(values) {
        Some(fit) => fit,
        None => return MarkerFit::Degenerate,
    };
    match fit_bimodal(values, max_em_iter) {
        Some(mixture) => MarkerFit::Bimodal { unimodal, mixture },
        None => MarkerFit::Unimodal { unimodal },
    }
}

/// Single-Gaussian MLE fit. Returns `None` for groups with (near-)constant
/// values, where neither model is identifiable.
pub fn fit_unimodal(values: &[f64]) -> Option<UnimodalFit> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let (mean, variance) = mean_variance(values);
    if variance < VAR_FLOOR {
        return None;
    }
    // Closed form at the MLE: logL = -n/2 * (ln(2*pi*var) + 1)
    let log_likelihood =
        -0.5 * n as f64 * ((2.0 * std::f64::consts::PI * variance).ln() + 1.0);
    Some(UnimodalFit {
        mean,
        variance,
        log_likelihood,
        aic: 2.0 * 2.0 - 2.0 * log_likelihood,
    })
}

/// Two-component Gaussian mixture fit by EM.
///
/// Seeding is deterministic: means at the first and third quartiles,
/// both variances at the sample variance, equal weights. This fixes the
/// component ordering problem at the source; components are additionally
/// sorted by mean before the result is returned.
///
/// Returns `None` when the fit degenerates: a component collapses to
/// near-zero variance, a component empties out, or the likelihood goes
/// non-finite. Callers treat that as "this marker does not discriminate".
pub fn fit_bimodal(values: &[f64], max_em_iter: usize) -> Option<MixtureFit> {
    let n = values.len();
    if n < 4 {
        return None;
    }
    let (_, variance) = mean_variance(values);
    if variance < VAR_FLOOR {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mut mean1 = quantile(&sorted, 0.25);
    let mut mean2 = quantile(&sorted, 0.75);
    if (mean2 - mean1).abs() < VAR_FLOOR.sqrt() {
        // Quartiles coincide; nudge the seeds apart by a fraction of the sd.
        let sd = variance.sqrt();
        mean1 -= 0.5 * sd;
        mean2 += 0.5 * sd;
    }
    let mut var1 = variance;
    let mut var2 = variance;
    let mut weight = 0.5f64;

    let mut responsibilities = vec![0.0f64; n];
    let mut log_likelihood = f64::NEG_INFINITY;
    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..max_em_iter {
        iterations = iter + 1;

        // E-step in log space to avoid underflow in the tails.
        let d1 = Normal::new(mean1, var1.sqrt()).ok()?;
        let d2 = Normal::new(mean2, var2.sqrt()).ok()?;
        let lw1 = weight.ln();
        let lw2 = (1.0 - weight).ln();

        let mut ll = 0.0;
        for (i, &x) in values.iter().enumerate() {
            let la = lw1 + d1.ln_pdf(x);
            let lb = lw2 + d2.ln_pdf(x);
            let m = la.max(lb);
            let ln_density = m + ((la - m).exp() + (lb - m).exp()).ln();
            responsibilities[i] = (la - ln_density).exp();
            ll += ln_density;
        }
        if !ll.is_finite() {
            return None;
        }

        if (ll - log_likelihood).abs() < LL_TOL * (1.0 + ll.abs()) {
            log_likelihood = ll;
            converged = true;
            break;
        }
        log_likelihood = ll;

        // M-step.
        let n1: f64 = responsibilities.iter().sum();
        let n2 = n as f64 - n1;
        if n1 < MIN_COMPONENT_MASS || n2 < MIN_COMPONENT_MASS {
            return None;
        }

        let mut m1 = 0.0;
        let mut m2 = 0.0;
        for (i, &x) in values.iter().enumerate() {
            m1 += responsibilities[i] * x;
            m2 += (1.0 - responsibilities[i]) * x;
        }
        mean1 = m1 / n1;
        mean2 = m2 / n2;

        let mut v1 = 0.0;
        let mut v2 = 0.0;
        for (i, &x) in values.iter().enumerate() {
            let e1 = x - mean1;
            let e2 = x - mean2;
            v1 += responsibilities[i] * e1 * e1;
            v2 += (1.0 - responsibilities[i]) * e2 * e2;
        }
        var1 = v1 / n1;
        var2 = v2 / n2;
        if var1 < VAR_FLOOR || var2 < VAR_FLOOR {
            return None;
        }

        weight = n1 / n as f64;
    }

    if !log_likelihood.is_finite() {
        return None;
    }

    let comp1 = GaussianComponent {
        mean: mean1,
        variance: var1,
        weight,
    };
    let comp2 = GaussianComponent {
        mean: mean2,
        variance: var2,
        weight: 1.0 - weight,
    };
    // `responsibilities` holds P(component 1 | x); flip when component 1
    // turned out to be the high-mean one.
    let (low, high, comp1_is_high) = if comp1.mean <= comp2.mean {
        (comp1, comp2, false)
    } else {
        (comp2, comp1, true)
    };
    let assignments = responsibilities
        .iter()
        .map(|&r1| {
            let high_resp = if comp1_is_high { r1 } else { 1.0 - r1 };
            high_resp >= 0.5
        })
        .collect();

    Some(MixtureFit {
        low,
        high,
        log_likelihood,
        aic: 2.0 * 5.0 - 2.0 * log_likelihood,
        assignments,
        iterations,
        converged,
    })
}

fn mean_variance(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    (mean, variance)
}

/// Linearly interpolated quantile of a pre-sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    let pos = q * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = pos - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::gaussian_sample;

    #[test]
    fn unimodal_fit_recovers_mean_and_variance() {
        let values = gaussian_sample(2.0, 1.5, 500);
        let fit = fit_unimodal(&values).unwrap();
        assert!((fit.mean - 2.0).abs() < 0.05);
        assert!((fit.variance - 2.25).abs() < 0.2);
        assert!(fit.log_likelihood.is_finite());
        assert!((fit.aic - (4.0 - 2.0 * fit.log_likelihood)).abs() < 1e-12);
    }

    #[test]
    fn bimodal_fit_separates_well_separated_modes() {
        let mut values = gaussian_sample(-3.0, 1.0, 100);
        values.extend(gaussian_sample(3.0, 1.0, 100));
        let fit = fit_bimodal(&values, 500).unwrap();
        assert!(fit.converged);
        assert!((fit.low.mean - -3.0).abs() < 0.3);
        assert!((fit.high.mean - 3.0).abs() < 0.3);
        assert!((fit.low.weight - 0.5).abs() < 0.05);
        // First 100 observations came from the low mode.
        let n_high_in_low_block = fit.assignments[..100].iter().filter(|&&a| a).count();
        let n_high_in_high_block = fit.assignments[100..].iter().filter(|&&a| a).count();
        assert!(n_high_in_low_block <= 2);
        assert!(n_high_in_high_block >= 98);
    }

    #[test]
    fn bimodal_beats_unimodal_on_separated_data() {
        let mut values = gaussian_sample(-3.0, 1.0, 100);
        values.extend(gaussian_sample(3.0, 1.0, 100));
        match fit_marker(&values, 500) {
            MarkerFit::Bimodal { unimodal, mixture } => {
                assert!(mixture.aic < unimodal.aic);
            }
            other => panic!("expected Bimodal, got {other:?}"),
        }
    }

    #[test]
    fn constant_data_is_degenerate() {
        let values = vec![1.0; 50];
        assert!(matches!(fit_marker(&values, 500), MarkerFit::Degenerate));
    }

    #[test]
    fn tiny_groups_do_not_fit() {
        assert!(fit_unimodal(&[1.0]).is_none());
        assert!(fit_bimodal(&[1.0, 2.0, 3.0], 500).is_none());
    }

    #[test]
    fn components_are_ordered_by_mean() {
        let mut values = gaussian_sample(5.0, 1.0, 80);
        values.extend(gaussian_sample(-5.0, 1.0, 80));
        let fit = fit_bimodal(&values, 500).unwrap();
        assert!(fit.low.mean < fit.high.mean);
    }
}
