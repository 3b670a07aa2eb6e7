//! Thurstonian utility fitting.
//!
//! Option `i` has a latent utility `N(mu_i, sigma_i^2)`; the probability that
//! A is preferred to B is `Phi((mu_A - mu_B) / sqrt(sigma_A^2 + sigma_B^2))`.
//!
//! Parameters are one mean and one log-standard-deviation per option, fitted
//! by full-batch Adam on the binary cross-entropy between predicted and
//! empirical preference probabilities. Each step first standardizes the means
//! to zero mean / unit sample std and rescales the variances by the same
//! factor, so only relative gaps matter. Gradients are derived analytically
//! through that normalization.
//!
//! Numeric limits: a near-constant mean vector is guarded only by the additive
//! epsilon in every division; no separate error is raised for it.

use std::f64::consts::{PI, SQRT_2};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erf;

/// Predicted probabilities are clamped to `[PROB_CLAMP, 1 - PROB_CLAMP]`.
const PROB_CLAMP: f64 = 1e-4;

/// Added to every normalization divisor.
const NORM_EPS: f64 = 1e-5;

/// Std of the random parameter initialization.
const INIT_SCALE: f64 = 0.01;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FitError {
    #[error("need at least 2 options to fit, got {0}")]
    TooFewOptions(usize),
    #[error("comparison references option {index} but only {n} exist")]
    IndexOutOfRange { index: usize, n: usize },
    #[error("comparison of option {0} with itself")]
    SelfComparison(usize),
    #[error("comparison label must be a probability in [0, 1]: {0}")]
    InvalidLabel(f64),
}

/// Fitted latent utility of one option.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Utility {
    pub mean: f64,
    pub variance: f64,
}

/// Empirical target: share of judgements preferring `a` over `b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    pub a: usize,
    pub b: usize,
    pub probability_a: f64,
}

#[derive(Debug, Clone)]
pub struct FitConfig {
    pub num_epochs: usize,
    pub learning_rate: f64,
    /// Seeds the parameter initialization.
    pub seed: u64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            num_epochs: 500,
            learning_rate: 0.01,
            seed: 42,
        }
    }
}

pub(crate) fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / SQRT_2))
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * PI).sqrt()
}

/// Probability that an option with utility `a` is preferred to one with `b`.
pub fn predict_probability(a: &Utility, b: &Utility) -> f64 {
    let var = (a.variance + b.variance).max(f64::MIN_POSITIVE);
    normal_cdf((a.mean - b.mean) / var.sqrt())
}

/// Fit utilities for `n` options to the given comparisons.
///
/// Returns one [`Utility`] per option, indexed by option id. Means have
/// sample mean ~0 and sample std ~1.
pub fn fit(
    n: usize,
    comparisons: &[Comparison],
    config: &FitConfig,
) -> Result<Vec<Utility>, FitError> {
    validate(n, comparisons)?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut mu: Vec<f64> = (0..n).map(|_| sample_normal(&mut rng) * INIT_SCALE).collect();
    let mut log_sd: Vec<f64> = (0..n).map(|_| sample_normal(&mut rng) * INIT_SCALE).collect();

    let mut adam_mu = Adam::new(n, config.learning_rate);
    let mut adam_sd = Adam::new(n, config.learning_rate);

    if !comparisons.is_empty() {
        for _ in 0..config.num_epochs {
            let (_, grad_mu, grad_sd) = loss_and_grad(&mu, &log_sd, comparisons);
            adam_mu.step(&mut mu, &grad_mu);
            adam_sd.step(&mut log_sd, &grad_sd);
        }
    }

    let norm = Normalized::new(&mu, &log_sd);
    Ok(norm
        .mu
        .into_iter()
        .zip(norm.sigma2)
        .map(|(mean, variance)| Utility { mean, variance })
        .collect())
}

/// Mean clamped binary cross-entropy of `utilities` against `comparisons`.
pub fn mean_log_loss(utilities: &[Utility], comparisons: &[Comparison]) -> Option<f64> {
    if comparisons.is_empty() {
        return None;
    }
    let mut total = 0.0;
    for c in comparisons {
        let (ua, ub) = (utilities.get(c.a)?, utilities.get(c.b)?);
        let p = predict_probability(ua, ub).clamp(PROB_CLAMP, 1.0 - PROB_CLAMP);
        total += bce(p, c.probability_a);
    }
    Some(total / comparisons.len() as f64)
}

fn validate(n: usize, comparisons: &[Comparison]) -> Result<(), FitError> {
    if n < 2 {
        return Err(FitError::TooFewOptions(n));
    }
    for c in comparisons {
        for index in [c.a, c.b] {
            if index >= n {
                return Err(FitError::IndexOutOfRange { index, n });
            }
        }
        if c.a == c.b {
            return Err(FitError::SelfComparison(c.a));
        }
        if !(0.0..=1.0).contains(&c.probability_a) {
            return Err(FitError::InvalidLabel(c.probability_a));
        }
    }
    Ok(())
}

fn bce(p: f64, y: f64) -> f64 {
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

// ---------------------------------------------------------------------
//  Normalization
// ---------------------------------------------------------------------

/// Standardized parameters plus the statistics needed to backpropagate.
struct Normalized {
    mu: Vec<f64>,
    sigma2: Vec<f64>,
    raw_mean: f64,
    /// Sample std of the raw means (n - 1 denominator), before epsilon.
    raw_sd: f64,
    /// `raw_sd + NORM_EPS`, the divisor for the means.
    std: f64,
}

impl Normalized {
    fn new(mu: &[f64], log_sd: &[f64]) -> Self {
        let n = mu.len() as f64;
        let raw_mean = mu.iter().sum::<f64>() / n;
        let ss: f64 = mu.iter().map(|m| (m - raw_mean).powi(2)).sum();
        let raw_sd = (ss / (n - 1.0)).sqrt();
        let std = raw_sd + NORM_EPS;
        let scale = 1.0 / (std + NORM_EPS);

        Self {
            mu: mu.iter().map(|m| (m - raw_mean) / std).collect(),
            sigma2: log_sd
                .iter()
                .map(|s| (2.0 * s).exp() * scale * scale)
                .collect(),
            raw_mean,
            raw_sd,
            std,
        }
    }
}

/// Loss and gradients w.r.t. the raw means and log-stds.
fn loss_and_grad(
    mu: &[f64],
    log_sd: &[f64],
    comparisons: &[Comparison],
) -> (f64, Vec<f64>, Vec<f64>) {
    let n = mu.len();
    let norm = Normalized::new(mu, log_sd);
    let count = comparisons.len() as f64;

    let mut loss = 0.0;
    let mut g_mu_norm = vec![0.0; n];
    let mut g_sigma2 = vec![0.0; n];

    for c in comparisons {
        let var = norm.sigma2[c.a] + norm.sigma2[c.b];
        let sqrt_var = var.sqrt();
        let z = (norm.mu[c.a] - norm.mu[c.b]) / sqrt_var;
        let p = normal_cdf(z);
        let pc = p.clamp(PROB_CLAMP, 1.0 - PROB_CLAMP);
        let y = c.probability_a;
        loss += bce(pc, y);

        // Clamp passes no gradient outside its range.
        if !(PROB_CLAMP..=1.0 - PROB_CLAMP).contains(&p) {
            continue;
        }
        let dl_dp = ((1.0 - y) / (1.0 - pc) - y / pc) / count;
        let dl_dz = dl_dp * normal_pdf(z);
        let g_delta = dl_dz / sqrt_var;
        let g_var = dl_dz * (-0.5 * z / var);

        g_mu_norm[c.a] += g_delta;
        g_mu_norm[c.b] -= g_delta;
        g_sigma2[c.a] += g_var;
        g_sigma2[c.b] += g_var;
    }
    loss /= count;

    // sigma2_i = exp(2 s_i) / (std + eps)^2
    let grad_sd: Vec<f64> = g_sigma2
        .iter()
        .zip(&norm.sigma2)
        .map(|(g, s2)| g * 2.0 * s2)
        .collect();

    // Both normalized vectors depend on every raw mean through `std`.
    let mut g_std = 0.0;
    for i in 0..n {
        g_std += g_sigma2[i] * (-2.0 * norm.sigma2[i] / (norm.std + NORM_EPS));
        g_std += g_mu_norm[i] * (-norm.mu[i] / norm.std);
    }
    let g_mean = g_mu_norm.iter().sum::<f64>() / n as f64;
    let dsd_scale = if norm.raw_sd > 0.0 {
        1.0 / ((n as f64 - 1.0) * norm.raw_sd)
    } else {
        0.0
    };

    let grad_mu: Vec<f64> = (0..n)
        .map(|j| {
            (g_mu_norm[j] - g_mean) / norm.std
                + g_std * (mu[j] - norm.raw_mean) * dsd_scale
        })
        .collect();

    (loss, grad_mu, grad_sd)
}

// ---------------------------------------------------------------------
//  Optimizer
// ---------------------------------------------------------------------

/// Adam with bias correction.
struct Adam {
    lr: f64,
    m: Vec<f64>,
    v: Vec<f64>,
    t: i32,
}

impl Adam {
    fn new(n: usize, lr: f64) -> Self {
        Self {
            lr,
            m: vec![0.0; n],
            v: vec![0.0; n],
            t: 0,
        }
    }

    fn step(&mut self, params: &mut [f64], grads: &[f64]) {
        self.t += 1;
        let bc1 = 1.0 - ADAM_BETA1.powi(self.t);
        let bc2 = 1.0 - ADAM_BETA2.powi(self.t);
        for ((p, g), (m, v)) in params
            .iter_mut()
            .zip(grads)
            .zip(self.m.iter_mut().zip(self.v.iter_mut()))
        {
            *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
            *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
            let m_hat = *m / bc1;
            let v_hat = *v / bc2;
            *p -= self.lr * m_hat / (v_hat.sqrt() + ADAM_EPS);
        }
    }
}

fn sample_normal(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(1e-12);
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_std(v: &[f64]) -> f64 {
        let n = v.len() as f64;
        let mean = v.iter().sum::<f64>() / n;
        (v.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    }

    fn complete_graph(true_means: &[f64], sigma2: f64) -> Vec<Comparison> {
        let n = true_means.len();
        let mut out = Vec::new();
        for a in 0..n {
            for b in (a + 1)..n {
                let z = (true_means[a] - true_means[b]) / (2.0 * sigma2).sqrt();
                out.push(Comparison {
                    a,
                    b,
                    probability_a: normal_cdf(z),
                });
            }
        }
        out
    }

    #[test]
    fn test_analytic_gradient_matches_finite_differences() {
        let mu = vec![0.3, -0.2, 0.05, 0.4];
        let log_sd = vec![0.1, -0.3, 0.2, 0.0];
        let comps = vec![
            Comparison { a: 0, b: 1, probability_a: 0.8 },
            Comparison { a: 1, b: 2, probability_a: 0.35 },
            Comparison { a: 0, b: 3, probability_a: 0.5 },
            Comparison { a: 2, b: 3, probability_a: 0.1 },
        ];
        let (_, g_mu, g_sd) = loss_and_grad(&mu, &log_sd, &comps);

        let h = 1e-6;
        for i in 0..mu.len() {
            let mut plus = mu.clone();
            let mut minus = mu.clone();
            plus[i] += h;
            minus[i] -= h;
            let numeric = (loss_and_grad(&plus, &log_sd, &comps).0
                - loss_and_grad(&minus, &log_sd, &comps).0)
                / (2.0 * h);
            assert!(
                (numeric - g_mu[i]).abs() < 1e-5,
                "d/dmu[{i}]: analytic {} numeric {numeric}",
                g_mu[i]
            );

            let mut plus = log_sd.clone();
            let mut minus = log_sd.clone();
            plus[i] += h;
            minus[i] -= h;
            let numeric = (loss_and_grad(&mu, &plus, &comps).0
                - loss_and_grad(&mu, &minus, &comps).0)
                / (2.0 * h);
            assert!(
                (numeric - g_sd[i]).abs() < 1e-5,
                "d/dlog_sd[{i}]: analytic {} numeric {numeric}",
                g_sd[i]
            );
        }
    }

    #[test]
    fn test_fit_recovers_ranking() {
        let true_means = [-2.0, -1.0, 0.0, 1.0, 2.0];
        let comps = complete_graph(&true_means, 1.0);
        let utils = fit(5, &comps, &FitConfig::default()).unwrap();

        for w in utils.windows(2) {
            assert!(w[0].mean < w[1].mean, "ordering broken: {utils:?}");
        }
        assert!(utils.iter().all(|u| u.variance.is_finite() && u.variance > 0.0));
    }

    #[test]
    fn test_fit_reduces_loss() {
        let comps = complete_graph(&[1.0, 0.0, -1.0, 0.5], 0.5);
        let short = FitConfig {
            num_epochs: 1,
            ..FitConfig::default()
        };
        let before = mean_log_loss(&fit(4, &comps, &short).unwrap(), &comps).unwrap();
        let after = mean_log_loss(&fit(4, &comps, &FitConfig::default()).unwrap(), &comps).unwrap();
        assert!(after < before, "before {before} after {after}");
    }

    #[test]
    fn test_output_is_standardized() {
        for n in [2usize, 3, 7] {
            let means: Vec<f64> = (0..n).map(|i| i as f64 * 0.7).collect();
            let comps = complete_graph(&means, 1.0);
            let utils = fit(n, &comps, &FitConfig::default()).unwrap();
            let m: Vec<f64> = utils.iter().map(|u| u.mean).collect();
            let mean = m.iter().sum::<f64>() / n as f64;
            assert!(mean.abs() < 1e-9, "n={n} mean={mean}");
            assert!((sample_std(&m) - 1.0).abs() < 1e-3, "n={n} std={}", sample_std(&m));
        }
    }

    #[test]
    fn test_no_comparisons_still_standardized() {
        let utils = fit(4, &[], &FitConfig::default()).unwrap();
        let m: Vec<f64> = utils.iter().map(|u| u.mean).collect();
        assert!((sample_std(&m) - 1.0).abs() < 1e-2);
    }

    #[test]
    fn test_fit_is_deterministic_for_seed() {
        let comps = complete_graph(&[0.0, 1.0, 2.0], 1.0);
        let a = fit(3, &comps, &FitConfig::default()).unwrap();
        let b = fit(3, &comps, &FitConfig::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_validation_errors() {
        let cfg = FitConfig::default();
        assert_eq!(fit(1, &[], &cfg), Err(FitError::TooFewOptions(1)));
        let bad_index = [Comparison { a: 0, b: 5, probability_a: 0.5 }];
        assert_eq!(
            fit(3, &bad_index, &cfg),
            Err(FitError::IndexOutOfRange { index: 5, n: 3 })
        );
        let self_cmp = [Comparison { a: 1, b: 1, probability_a: 0.5 }];
        assert_eq!(fit(3, &self_cmp, &cfg), Err(FitError::SelfComparison(1)));
        let bad_label = [Comparison { a: 0, b: 1, probability_a: 1.2 }];
        assert_eq!(fit(3, &bad_label, &cfg), Err(FitError::InvalidLabel(1.2)));
    }

    #[test]
    fn test_predict_probability_symmetry() {
        let a = Utility { mean: 1.0, variance: 0.5 };
        let b = Utility { mean: -0.5, variance: 1.5 };
        let p = predict_probability(&a, &b);
        assert!(p > 0.5);
        assert!((p + predict_probability(&b, &a) - 1.0).abs() < 1e-12);
    }
}
