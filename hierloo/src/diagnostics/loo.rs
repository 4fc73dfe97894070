//! Approximate leave-one-out cross-validation
//!
//! Pareto-smoothed importance sampling (PSIS-LOO): for each observation the
//! importance ratios `1 / p(y_i | theta_s)` have their upper tail replaced
//! by quantiles of a fitted generalized Pareto distribution. The fitted
//! shape `k` doubles as a reliability diagnostic for that observation.
//!
//! Everything here is deterministic; the same log-likelihood matrix always
//! gives the same result.

use crate::error::{Error, Result};
use crate::fit::{Fit, LogLikMatrix};
use crate::math;
use crate::model::{BoundModel, LogDensity};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Per-observation contribution to the LOO estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointwiseLoo {
    pub elpd_loo: f64,
    pub p_loo: f64,
    pub looic: f64,
    pub pareto_k: f64,
}

/// Pareto k counts against the sample-size dependent threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParetoDiagnostics {
    pub threshold: f64,
    /// Observations with `k` above `threshold`
    pub n_high: usize,
    /// Observations with `k` above 1
    pub n_very_high: usize,
    pub max_k: f64,
}

impl ParetoDiagnostics {
    pub fn all_good(&self) -> bool {
        self.n_high == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LooResult {
    pub elpd_loo: f64,
    pub se_elpd_loo: f64,
    pub p_loo: f64,
    pub se_p_loo: f64,
    pub looic: f64,
    pub se_looic: f64,
    pub pointwise: Vec<PointwiseLoo>,
    pub diagnostics: ParetoDiagnostics,
    pub n_draws: usize,
    pub data_fingerprint: String,
}

impl LooResult {
    pub fn n_obs(&self) -> usize {
        self.pointwise.len()
    }

    pub fn pareto_k(&self) -> Vec<f64> {
        self.pointwise.iter().map(|p| p.pareto_k).collect()
    }
}

/// Pareto-smoothed importance sampling LOO over a draws × observations matrix.
pub fn psis_loo(log_lik: &LogLikMatrix) -> Result<LooResult> {
    let n_draws = log_lik.n_draws();
    let n_obs = log_lik.n_obs();
    if n_obs == 0 {
        return Err(Error::Loo("log-likelihood matrix has no observations".to_string()));
    }
    if n_draws < 2 {
        return Err(Error::Loo(format!(
            "need at least 2 draws, got {}",
            n_draws
        )));
    }
    for (s, row) in log_lik.rows().iter().enumerate() {
        if row.len() != n_obs {
            return Err(Error::Loo(format!(
                "draw {} has {} log-likelihood values, expected {}",
                s + 1,
                row.len(),
                n_obs
            )));
        }
        if let Some(i) = row.iter().position(|v| !v.is_finite()) {
            return Err(Error::Loo(format!(
                "non-finite log-likelihood at draw {}, observation {}",
                s + 1,
                i + 1
            )));
        }
    }

    let log_s = (n_draws as f64).ln();
    let mut pointwise = Vec::with_capacity(n_obs);
    for i in 0..n_obs {
        let ll = log_lik.observation(i);
        let log_ratios: Vec<f64> = ll.iter().map(|v| -v).collect();
        let (log_weights, k) = psis_smooth(&log_ratios);

        let elpd_loo = math::log_sum_exp(
            &log_weights
                .iter()
                .zip(&ll)
                .map(|(w, l)| w + l)
                .collect::<Vec<f64>>(),
        );
        let lpd = math::log_sum_exp(&ll) - log_s;
        pointwise.push(PointwiseLoo {
            elpd_loo,
            p_loo: lpd - elpd_loo,
            looic: -2.0 * elpd_loo,
            pareto_k: k,
        });
    }

    let threshold = k_threshold(n_draws);
    let max_k = pointwise
        .iter()
        .map(|p| p.pareto_k)
        .fold(f64::NEG_INFINITY, f64::max);
    let n_high = pointwise.iter().filter(|p| p.pareto_k > threshold).count();
    let n_very_high = pointwise.iter().filter(|p| p.pareto_k > 1.0).count();
    if n_high > 0 {
        warn!(
            n_high,
            n_obs,
            threshold,
            max_k,
            "Pareto k diagnostic values are too high; LOO estimate may be unreliable"
        );
    }

    let elpd: Vec<f64> = pointwise.iter().map(|p| p.elpd_loo).collect();
    let p_loo: Vec<f64> = pointwise.iter().map(|p| p.p_loo).collect();
    let elpd_loo = elpd.iter().sum::<f64>();
    let se_elpd_loo = total_se(&elpd);
    debug!(elpd_loo, se_elpd_loo, n_obs, n_draws, "psis-loo");

    Ok(LooResult {
        elpd_loo,
        se_elpd_loo,
        p_loo: p_loo.iter().sum(),
        se_p_loo: total_se(&p_loo),
        looic: -2.0 * elpd_loo,
        se_looic: 2.0 * se_elpd_loo,
        pointwise,
        diagnostics: ParetoDiagnostics {
            threshold,
            n_high,
            n_very_high,
            max_k,
        },
        n_draws,
        data_fingerprint: log_lik.data_fingerprint().to_string(),
    })
}

/// `min(1 - 1/log10(S), 0.7)`.
pub fn k_threshold(n_draws: usize) -> f64 {
    (1.0 - 1.0 / (n_draws as f64).log10()).min(0.7)
}

/// Standard error of a sum of `n` pointwise terms.
fn total_se(values: &[f64]) -> f64 {
    (values.len() as f64 * math::variance(values)).sqrt()
}

/// Smooth one observation's log importance ratios. Returns normalized log
/// weights (in draw order) and the Pareto shape estimate.
fn psis_smooth(log_ratios: &[f64]) -> (Vec<f64>, f64) {
    let s = log_ratios.len();
    let max = log_ratios.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut lw: Vec<f64> = log_ratios.iter().map(|r| r - max).collect();

    let tail_len = (0.2 * s as f64).min(3.0 * (s as f64).sqrt()).ceil() as usize;
    let mut k = f64::INFINITY;
    if tail_len >= 5 && tail_len < s {
        let mut order: Vec<usize> = (0..s).collect();
        order.sort_by(|&a, &b| lw[a].total_cmp(&lw[b]));
        let tail_idx = &order[s - tail_len..];
        let cutoff = lw[order[s - tail_len - 1]];
        let exp_cutoff = cutoff.exp();
        let tail: Vec<f64> = tail_idx.iter().map(|&j| lw[j].exp() - exp_cutoff).collect();

        let (shape, scale) = gpd_fit(&tail);
        k = shape;
        if shape.is_finite() {
            let m = tail_len as f64;
            for (rank, &j) in tail_idx.iter().enumerate() {
                let p = (rank as f64 + 0.5) / m;
                let smoothed = (gpd_quantile(p, shape, scale) + exp_cutoff).ln();
                if smoothed.is_finite() {
                    lw[j] = smoothed;
                }
            }
        }
    }

    // truncate at S^(3/4) times the mean weight
    let log_trunc = 0.75 * (s as f64).ln() + math::log_sum_exp(&lw) - (s as f64).ln();
    for w in lw.iter_mut() {
        if *w > log_trunc {
            *w = log_trunc;
        }
    }

    let norm = math::log_sum_exp(&lw);
    for w in lw.iter_mut() {
        *w -= norm;
    }
    (lw, k)
}

/// Generalized Pareto fit of Zhang and Stephens (2009), with the weakly
/// informative shrinkage of the shape toward 0.5. `x` must be ascending
/// and non-negative. Returns `(k, sigma)`.
pub fn gpd_fit(x: &[f64]) -> (f64, f64) {
    let n = x.len();
    if n == 0 {
        return (f64::INFINITY, f64::NAN);
    }
    let prior = 3.0;
    let m = 30 + (n as f64).sqrt().floor() as usize;
    let quartile = x[((n as f64 / 4.0 + 0.5).floor() as usize).max(1) - 1];
    let x_max = x[n - 1];
    if !(quartile > 0.0 && x_max.is_finite()) {
        return (f64::INFINITY, f64::NAN);
    }

    let thetas: Vec<f64> = (1..=m)
        .map(|j| {
            1.0 / x_max + (1.0 - (m as f64 / (j as f64 - 0.5)).sqrt()) / prior / quartile
        })
        .collect();
    let profile: Vec<f64> = thetas
        .iter()
        .map(|&theta| n as f64 * profile_log_lik(theta, x))
        .collect();
    let norm = math::log_sum_exp(&profile);
    let theta_hat: f64 = thetas
        .iter()
        .zip(&profile)
        .map(|(t, l)| {
            let w = (l - norm).exp();
            if w.is_finite() {
                t * w
            } else {
                0.0
            }
        })
        .sum();

    let k = math::mean(&x.iter().map(|v| (-theta_hat * v).ln_1p()).collect::<Vec<f64>>());
    let sigma = -k / theta_hat;

    let a = 10.0;
    let k = k * n as f64 / (n as f64 + a) + a * 0.5 / (n as f64 + a);
    if k.is_nan() {
        (f64::INFINITY, sigma)
    } else {
        (k, sigma)
    }
}

fn profile_log_lik(theta: f64, x: &[f64]) -> f64 {
    let b = -theta;
    let k = math::mean(&x.iter().map(|v| (b * v).ln_1p()).collect::<Vec<f64>>());
    let value = (b / k).ln() - k - 1.0;
    if value.is_nan() {
        f64::NEG_INFINITY
    } else {
        value
    }
}

/// Quantile function of the generalized Pareto distribution with location 0.
pub fn gpd_quantile(p: f64, k: f64, sigma: f64) -> f64 {
    if !(sigma > 0.0) {
        return f64::NAN;
    }
    if k.abs() < 1e-12 {
        -sigma * (-p).ln_1p()
    } else {
        sigma * (-k * (-p).ln_1p()).exp_m1() / k
    }
}

/// One row of a model comparison, relative to the best model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub name: String,
    pub elpd_loo: f64,
    pub se_elpd_loo: f64,
    pub elpd_diff: f64,
    pub se_diff: f64,
    pub p_loo: f64,
    pub looic: f64,
}

/// Models ranked by `elpd_loo`, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub rows: Vec<ComparisonRow>,
}

impl Comparison {
    pub fn best(&self) -> &str {
        self.rows.first().map(|r| r.name.as_str()).unwrap_or("")
    }

    pub fn ranking(&self) -> Vec<&str> {
        self.rows.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn render_table(&self) -> String {
        let width = self.rows.iter().map(|r| r.name.len()).max().unwrap_or(5).max(5);
        let mut out = format!(
            "{:<width$}  {:>10}  {:>8}  {:>10}  {:>8}  {:>8}\n",
            "model",
            "elpd_loo",
            "se",
            "elpd_diff",
            "se_diff",
            "p_loo",
            width = width
        );
        for r in &self.rows {
            out.push_str(&format!(
                "{:<width$}  {:>10.2}  {:>8.2}  {:>10.2}  {:>8.2}  {:>8.2}\n",
                r.name,
                r.elpd_loo,
                r.se_elpd_loo,
                r.elpd_diff,
                r.se_diff,
                r.p_loo,
                width = width
            ));
        }
        out
    }
}

/// Rank fits by expected log predictive density. The result does not depend
/// on the order of `entries`.
pub fn loo_compare(entries: &[(&str, &LooResult)]) -> Result<Comparison> {
    if entries.len() < 2 {
        return Err(Error::IncompatibleComparison(format!(
            "need at least 2 models to compare, got {}",
            entries.len()
        )));
    }
    let (first_name, first) = entries[0];
    for (name, loo) in &entries[1..] {
        if loo.n_obs() != first.n_obs() {
            return Err(Error::IncompatibleComparison(format!(
                "{} has {} observations but {} has {}",
                name,
                loo.n_obs(),
                first_name,
                first.n_obs()
            )));
        }
        if loo.data_fingerprint != first.data_fingerprint {
            return Err(Error::IncompatibleComparison(format!(
                "{} and {} were computed on different data",
                name, first_name
            )));
        }
    }

    let mut sorted: Vec<(&str, &LooResult)> = entries.to_vec();
    sorted.sort_by(|a, b| {
        b.1.elpd_loo
            .total_cmp(&a.1.elpd_loo)
            .then_with(|| a.0.cmp(b.0))
    });

    let best = sorted[0].1;
    let rows = sorted
        .iter()
        .map(|(name, loo)| {
            let diffs: Vec<f64> = loo
                .pointwise
                .iter()
                .zip(&best.pointwise)
                .map(|(a, b)| a.elpd_loo - b.elpd_loo)
                .collect();
            ComparisonRow {
                name: name.to_string(),
                elpd_loo: loo.elpd_loo,
                se_elpd_loo: loo.se_elpd_loo,
                elpd_diff: loo.elpd_loo - best.elpd_loo,
                se_diff: total_se(&diffs),
                p_loo: loo.p_loo,
                looic: loo.looic,
            }
        })
        .collect();
    Ok(Comparison { rows })
}

/// Log pointwise predictive density of new data under a fit:
/// `sum_i log mean_s p(y_i | theta_s)`.
///
/// `model` is the fit's model bound to the held-out dataset; its parameter
/// layout must match the fit's.
pub fn heldout_elpd(fit: &Fit, model: &BoundModel) -> Result<f64> {
    let rows = fit.parameter_rows();
    let n_params = model.param_names().len();
    if rows.is_empty() {
        return Err(Error::Loo("fit has no draws".to_string()));
    }
    if rows[0].len() != n_params {
        return Err(Error::DataContract(format!(
            "fit has {} parameters but the held-out model expects {}",
            rows[0].len(),
            n_params
        )));
    }

    let n_obs = model.n_obs();
    let mut by_obs = vec![Vec::with_capacity(rows.len()); n_obs];
    let mut ll = vec![0.0; n_obs];
    for row in &rows {
        model.log_lik(row, &mut ll);
        for (column, value) in by_obs.iter_mut().zip(&ll) {
            column.push(*value);
        }
    }
    let log_s = (rows.len() as f64).ln();
    Ok(by_obs
        .iter()
        .map(|column| math::log_sum_exp(column) - log_s)
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use rand_distr::{Distribution, Normal};

    fn normal_log_lik(n_draws: usize, ys: &[f64], seed: u64) -> LogLikMatrix {
        // posterior draws of a normal mean, unit observation noise
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let ybar = math::mean(ys);
        let post = Normal::new(ybar, 1.0 / (ys.len() as f64).sqrt()).unwrap();
        let rows = (0..n_draws)
            .map(|_| {
                let m = post.sample(&mut rng);
                ys.iter().map(|y| math::normal_lpdf(*y, m, 1.0)).collect()
            })
            .collect();
        LogLikMatrix::new(rows, ys.len(), "fp".to_string())
    }

    #[test]
    fn test_gpd_fit_recovers_exponential_shape() {
        // exponential quantiles: shape 0
        let n = 400;
        let x: Vec<f64> = (1..=n)
            .map(|i| -(1.0 - (i as f64 - 0.5) / n as f64).ln())
            .collect();
        let (k, sigma) = gpd_fit(&x);
        assert!(k.abs() < 0.15, "k = {}", k);
        assert!((sigma - 1.0).abs() < 0.2, "sigma = {}", sigma);
    }

    #[test]
    fn test_gpd_quantile_zero_shape_is_exponential() {
        let q = gpd_quantile(0.5, 0.0, 2.0);
        assert!((q - 2.0 * 2f64.ln()).abs() < 1e-12);
        let q = gpd_quantile(0.5, 1e-8, 2.0);
        assert!((q - 2.0 * 2f64.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_loo_close_to_lpd_for_well_specified_model() {
        let ys: Vec<f64> = (0..50).map(|i| ((i * 37) % 23) as f64 / 10.0 - 1.1).collect();
        let ll = normal_log_lik(1000, &ys, 3);
        let loo = psis_loo(&ll).unwrap();
        assert_eq!(loo.n_obs(), 50);
        // roughly one effective parameter
        assert!(loo.p_loo > 0.5 && loo.p_loo < 2.0, "p_loo = {}", loo.p_loo);
        assert!(loo.diagnostics.all_good(), "{:?}", loo.diagnostics);
        assert!((loo.looic + 2.0 * loo.elpd_loo).abs() < 1e-9);
        assert!(loo.se_elpd_loo > 0.0);
    }

    #[test]
    fn test_loo_is_deterministic() {
        let ys = [0.3, -0.2, 1.4, 0.8, -1.0, 0.1];
        let ll = normal_log_lik(500, &ys, 11);
        assert_eq!(psis_loo(&ll).unwrap(), psis_loo(&ll).unwrap());
    }

    #[test]
    fn test_outlier_gets_high_k() {
        let mut ys: Vec<f64> = (0..20).map(|i| (i as f64 - 10.0) / 20.0).collect();
        ys.push(8.0);
        let ll = normal_log_lik(1000, &ys, 5);
        let loo = psis_loo(&ll).unwrap();
        let k = loo.pareto_k();
        let outlier_k = k[20];
        assert!(k[..20].iter().all(|&v| v < outlier_k));
    }

    #[test]
    fn test_loo_rejects_bad_input() {
        let empty = LogLikMatrix::new(vec![vec![]; 10], 0, "fp".to_string());
        assert!(matches!(psis_loo(&empty), Err(Error::Loo(_))));

        let one_draw = LogLikMatrix::new(vec![vec![-1.0, -2.0]], 2, "fp".to_string());
        assert!(matches!(psis_loo(&one_draw), Err(Error::Loo(_))));

        let nan = LogLikMatrix::new(
            vec![vec![-1.0, f64::NAN], vec![-1.0, -2.0]],
            2,
            "fp".to_string(),
        );
        assert!(matches!(psis_loo(&nan), Err(Error::Loo(_))));
    }

    #[test]
    fn test_compare_is_order_invariant() {
        let ys = [0.3, -0.2, 1.4, 0.8, -1.0, 0.1, 0.5, 0.0];
        let good = psis_loo(&normal_log_lik(400, &ys, 1)).unwrap();
        let mut bad_rows = normal_log_lik(400, &ys, 2).rows().to_vec();
        for row in bad_rows.iter_mut() {
            for v in row.iter_mut() {
                *v -= 0.5;
            }
        }
        let bad = psis_loo(&LogLikMatrix::new(bad_rows, ys.len(), "fp".to_string())).unwrap();

        let a = loo_compare(&[("good", &good), ("bad", &bad)]).unwrap();
        let b = loo_compare(&[("bad", &bad), ("good", &good)]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.best(), "good");
        assert_eq!(a.rows[0].elpd_diff, 0.0);
        assert!(a.rows[1].elpd_diff < 0.0);
    }

    #[test]
    fn test_compare_rejects_mismatched_data() {
        let ys = [0.3, -0.2, 1.4, 0.8];
        let a = psis_loo(&normal_log_lik(200, &ys, 1)).unwrap();
        let other = normal_log_lik(200, &ys, 2);
        let b = psis_loo(&LogLikMatrix::new(
            other.rows().to_vec(),
            ys.len(),
            "other".to_string(),
        ))
        .unwrap();
        assert!(matches!(
            loo_compare(&[("a", &a), ("b", &b)]),
            Err(Error::IncompatibleComparison(_))
        ));
        assert!(matches!(
            loo_compare(&[("a", &a)]),
            Err(Error::IncompatibleComparison(_))
        ));
    }
}
