//! Latent mean-reverting walk with binomial observations
//!
//! ```text
//! mu    ~ Normal(0, 1.5)
//! sigma ~ HalfNormal(1)
//! x[1]  ~ Normal(0, sigma)
//! x[t]  ~ Normal(rho[t] * x[t-1], sigma * sqrt(1 - rho[t]^2)),  rho[t] = exp(-(time[t] - time[t-1]) / length_scale)
//! y[t]  ~ Binomial(n[t], inv_logit(mu + x[t]))
//! ```
//!
//! The walk is stationary with marginal sd `sigma`; `length_scale` is data.

use super::{LogDensity, POPULATION_PRIOR_SD};
use crate::data::PollDataset;
use crate::error::{Error, Result};
use crate::math;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingSpec {
    pub length_scale: f64,
    pub log_lik: bool,
}

impl PollingSpec {
    pub fn new(length_scale: f64) -> Self {
        Self {
            length_scale,
            log_lik: false,
        }
    }

    pub fn name(&self) -> String {
        let base = format!("polls_walk_ls{}", self.length_scale).replace(['.', '-'], "p");
        if self.log_lik {
            format!("{}_loglik", base)
        } else {
            base
        }
    }
}

/// Unconstrained layout: `mu, ln(sigma), x[1..T]`.
#[derive(Debug, Clone)]
pub struct PollingModel {
    spec: PollingSpec,
    successes: Vec<u32>,
    trials: Vec<u32>,
    /// `rho[t]` for t >= 1; `rho[0]` is 0 (stationary start)
    rho: Vec<f64>,
    /// `sqrt(1 - rho[t]^2)`
    innovation_sd: Vec<f64>,
    /// `ln C(n[t], y[t])`, constant in the parameters
    log_choose: Vec<f64>,
    fingerprint: String,
}

impl PollingModel {
    pub fn new(spec: PollingSpec, data: &PollDataset) -> Result<Self> {
        if !(spec.length_scale > 0.0 && spec.length_scale.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "length_scale must be positive, got {}",
                spec.length_scale
            )));
        }
        data.validate()?;
        let mut rho = vec![0.0; data.len()];
        for t in 1..data.len() {
            rho[t] = (-(data.times[t] - data.times[t - 1]) / spec.length_scale).exp();
        }
        let innovation_sd = rho.iter().map(|r| (1.0 - r * r).sqrt()).collect();
        let log_choose = data
            .successes
            .iter()
            .zip(&data.trials)
            .map(|(&y, &n)| math::ln_choose(n, y))
            .collect();
        Ok(Self {
            spec,
            successes: data.successes.clone(),
            trials: data.trials.clone(),
            rho,
            innovation_sd,
            log_choose,
            fingerprint: data.fingerprint(),
        })
    }

    pub fn spec(&self) -> &PollingSpec {
        &self.spec
    }

    fn n_steps(&self) -> usize {
        self.successes.len()
    }

    fn eval(&self, theta: &[f64], jacobian: bool, mut grad: Option<&mut [f64]>) -> f64 {
        let n = self.n_steps();
        let mu = theta[0];
        let log_sigma = theta[1];
        let sigma = log_sigma.exp();
        let x = &theta[2..2 + n];
        let prior_var = POPULATION_PRIOR_SD * POPULATION_PRIOR_SD;

        let mut lp = -0.5 * mu * mu / prior_var - 0.5 * sigma * sigma;
        let mut d_mu = -mu / prior_var;
        let mut d_log_sigma = -sigma * sigma;
        if jacobian {
            lp += log_sigma;
            d_log_sigma += 1.0;
        }

        // walk
        for t in 0..n {
            let prev = if t == 0 { 0.0 } else { self.rho[t] * x[t - 1] };
            let scale = sigma * self.innovation_sd[t];
            let e = (x[t] - prev) / scale;
            lp += -0.5 * e * e - scale.ln();
            d_log_sigma += e * e - 1.0;
            if let Some(g) = grad.as_deref_mut() {
                g[2 + t] -= e / scale;
                if t > 0 {
                    g[2 + t - 1] += e * self.rho[t] / scale;
                }
            }
        }

        // observations
        for t in 0..n {
            let eta = mu + x[t];
            let (y, trials) = (self.successes[t] as f64, self.trials[t] as f64);
            lp += y * math::log_inv_logit(eta) + (trials - y) * math::log1m_inv_logit(eta);
            let score = y - trials * math::inv_logit(eta);
            d_mu += score;
            if let Some(g) = grad.as_deref_mut() {
                g[2 + t] += score;
            }
        }

        if let Some(g) = grad {
            g[0] += d_mu;
            g[1] += d_log_sigma;
        }
        if lp.is_nan() {
            f64::NEG_INFINITY
        } else {
            lp
        }
    }
}

impl LogDensity for PollingModel {
    fn dim(&self) -> usize {
        2 + self.n_steps()
    }

    fn param_names(&self) -> Vec<String> {
        let mut names = vec!["mu".to_string(), "sigma".to_string()];
        names.extend((1..=self.n_steps()).map(|t| format!("x[{}]", t)));
        names
    }

    fn log_density(&self, theta: &[f64], jacobian: bool) -> f64 {
        self.eval(theta, jacobian, None)
    }

    fn gradient(&self, theta: &[f64], jacobian: bool, grad: &mut [f64]) -> f64 {
        grad.iter_mut().for_each(|g| *g = 0.0);
        self.eval(theta, jacobian, Some(grad))
    }

    fn constrain(&self, theta: &[f64]) -> Vec<f64> {
        let mut out = theta.to_vec();
        out[1] = theta[1].exp();
        out
    }

    fn unconstrain(&self, constrained: &[f64]) -> Vec<f64> {
        let mut out = constrained.to_vec();
        out[1] = constrained[1].ln();
        out
    }

    fn generated_names(&self) -> Vec<String> {
        (1..=self.n_steps()).map(|t| format!("p[{}]", t)).collect()
    }

    fn generated(&self, constrained: &[f64]) -> Vec<f64> {
        let mu = constrained[0];
        constrained[2..2 + self.n_steps()]
            .iter()
            .map(|x| math::inv_logit(mu + x))
            .collect()
    }

    fn has_log_lik(&self) -> bool {
        self.spec.log_lik
    }

    fn n_obs(&self) -> usize {
        self.n_steps()
    }

    fn log_lik(&self, constrained: &[f64], out: &mut [f64]) {
        let mu = constrained[0];
        for t in 0..self.n_steps() {
            let eta = mu + constrained[2 + t];
            let (y, n) = (self.successes[t] as f64, self.trials[t] as f64);
            out[t] = self.log_choose[t]
                + y * math::log_inv_logit(eta)
                + (n - y) * math::log1m_inv_logit(eta);
        }
    }

    fn data_fingerprint(&self) -> String {
        self.fingerprint.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::finite_difference_gradient;

    fn data() -> PollDataset {
        PollDataset::new(
            vec![0.0, 1.0, 3.0, 4.0, 7.0],
            vec![48, 52, 55, 51, 40],
            vec![100, 100, 100, 100, 100],
        )
        .unwrap()
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let model = PollingModel::new(PollingSpec::new(3.0), &data()).unwrap();
        let theta = [0.1, -0.7, 0.2, -0.1, 0.3, 0.05, -0.4];
        for jacobian in [true, false] {
            let mut grad = vec![0.0; model.dim()];
            model.gradient(&theta, jacobian, &mut grad);
            let fd = finite_difference_gradient(&model, &theta, jacobian);
            for (a, b) in grad.iter().zip(&fd) {
                assert!((a - b).abs() < 1e-4, "analytic {} vs numeric {}", a, b);
            }
        }
    }

    #[test]
    fn test_log_lik_matches_binomial_mass() {
        let mut spec = PollingSpec::new(3.0);
        spec.log_lik = true;
        let model = PollingModel::new(spec, &data()).unwrap();
        let constrained = [0.0, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0];
        let mut out = vec![0.0; 5];
        model.log_lik(&constrained, &mut out);
        assert!((out[0] - math::binomial_logit_lpmf(48, 100, 0.0)).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_bad_length_scale() {
        assert!(PollingModel::new(PollingSpec::new(0.0), &data()).is_err());
    }
}
