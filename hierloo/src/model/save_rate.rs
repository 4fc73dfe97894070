//! Grouped Bernoulli save-rate models
//!
//! Independent:  p[j] ~ Beta(1, 1);                          y[i] ~ Bernoulli(p[group[i]])
//! Fixed scale:  mu ~ Normal(0, 1.5); alpha[j] ~ Normal(mu, tau);  y[i] ~ Bernoulli(F(alpha[group[i]]))
//! Estimated:    as fixed scale, with tau a parameter under a [`ScalePrior`]
//!
//! `F` is the inverse link (logistic or standard normal CDF). The
//! hierarchical variants are centered, so the joint density is unbounded as
//! `tau -> 0` when nothing but a flat prior holds `tau` away from zero.

use super::{LogDensity, POPULATION_PRIOR_SD};
use crate::data::SaveDataset;
use crate::error::{Error, Result};
use crate::math;
use serde::{Deserialize, Serialize};

/// Maps a linear predictor to a success probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Link {
    Logit,
    Probit,
}

impl Link {
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            Link::Logit => math::inv_logit(eta),
            Link::Probit => math::std_normal_cdf(eta),
        }
    }

    /// `ln P(y = 1)`
    pub fn log_success(self, eta: f64) -> f64 {
        match self {
            Link::Logit => math::log_inv_logit(eta),
            Link::Probit => math::std_normal_log_cdf(eta),
        }
    }

    /// `ln P(y = 0)`
    pub fn log_failure(self, eta: f64) -> f64 {
        match self {
            Link::Logit => math::log1m_inv_logit(eta),
            Link::Probit => math::std_normal_log_cdf(-eta),
        }
    }

    /// Derivative of `s ln F(eta) + f ln(1 - F(eta))` with respect to `eta`.
    fn score(self, successes: f64, failures: f64, eta: f64) -> f64 {
        match self {
            Link::Logit => successes - (successes + failures) * math::inv_logit(eta),
            Link::Probit => successes * math::inv_mills(eta) - failures * math::inv_mills(-eta),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Link::Logit => "logit",
            Link::Probit => "probit",
        }
    }
}

/// Prior on the group-level scale `tau`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScalePrior {
    /// Uniform on `(0, inf)`; improper.
    Flat,
    HalfNormal(f64),
    Exponential(f64),
}

impl ScalePrior {
    fn log_density(self, tau: f64) -> f64 {
        match self {
            ScalePrior::Flat => 0.0,
            ScalePrior::HalfNormal(s) => -0.5 * (tau / s).powi(2),
            ScalePrior::Exponential(rate) => -rate * tau,
        }
    }

    /// Derivative with respect to `ln tau`.
    fn d_log_tau(self, tau: f64) -> f64 {
        match self {
            ScalePrior::Flat => 0.0,
            ScalePrior::HalfNormal(s) => -(tau / s).powi(2),
            ScalePrior::Exponential(rate) => -rate * tau,
        }
    }

    fn label(self) -> String {
        match self {
            ScalePrior::Flat => "flat".to_string(),
            ScalePrior::HalfNormal(s) => format!("halfnormal{}", s),
            ScalePrior::Exponential(r) => format!("exponential{}", r),
        }
    }
}

/// How group rates are tied together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Pooling {
    Independent,
    FixedScale(f64),
    EstimatedScale(ScalePrior),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRateSpec {
    pub pooling: Pooling,
    /// Ignored by [`Pooling::Independent`], which puts its prior on `p` directly.
    pub link: Link,
    pub log_lik: bool,
}

impl SaveRateSpec {
    pub fn independent() -> Self {
        Self {
            pooling: Pooling::Independent,
            link: Link::Logit,
            log_lik: false,
        }
    }

    pub fn fixed_scale(tau: f64, link: Link) -> Self {
        Self {
            pooling: Pooling::FixedScale(tau),
            link,
            log_lik: false,
        }
    }

    pub fn estimated_scale(prior: ScalePrior, link: Link) -> Self {
        Self {
            pooling: Pooling::EstimatedScale(prior),
            link,
            log_lik: false,
        }
    }

    pub fn name(&self) -> String {
        let base = match self.pooling {
            Pooling::Independent => "saves_independent".to_string(),
            Pooling::FixedScale(tau) => format!("saves_tau{}_{}", tau, self.link.as_str()),
            Pooling::EstimatedScale(prior) => {
                format!("saves_{}_{}", prior.label(), self.link.as_str())
            }
        };
        let base = base.replace(['.', '-'], "p");
        if self.log_lik {
            format!("{}_loglik", base)
        } else {
            base
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bad = match self.pooling {
            Pooling::FixedScale(tau) => !(tau > 0.0 && tau.is_finite()),
            Pooling::EstimatedScale(ScalePrior::HalfNormal(s)) => !(s > 0.0 && s.is_finite()),
            Pooling::EstimatedScale(ScalePrior::Exponential(r)) => !(r > 0.0 && r.is_finite()),
            _ => false,
        };
        if bad {
            return Err(Error::InvalidConfig(format!(
                "scale settings must be positive and finite: {:?}",
                self.pooling
            )));
        }
        Ok(())
    }
}

/// Save-rate spec bound to shot data.
///
/// Unconstrained layout:
/// * independent: `logit(p[1..J])`
/// * fixed scale: `mu, alpha[1..J]`
/// * estimated scale: `mu, ln(tau), alpha[1..J]`
#[derive(Debug, Clone)]
pub struct SaveRateModel {
    spec: SaveRateSpec,
    groups: Vec<String>,
    shot_groups: Vec<usize>,
    shot_outcomes: Vec<bool>,
    successes: Vec<f64>,
    failures: Vec<f64>,
    fingerprint: String,
}

impl SaveRateModel {
    pub fn new(spec: SaveRateSpec, data: &SaveDataset) -> Result<Self> {
        spec.validate()?;
        data.validate()?;
        let counts = data.counts();
        Ok(Self {
            spec,
            groups: data.groups.clone(),
            shot_groups: data.shots.iter().map(|s| s.group).collect(),
            shot_outcomes: data.shots.iter().map(|s| s.saved).collect(),
            successes: counts.iter().map(|c| c.0 as f64).collect(),
            failures: counts.iter().map(|c| c.1 as f64).collect(),
            fingerprint: data.fingerprint(),
        })
    }

    pub fn spec(&self) -> &SaveRateSpec {
        &self.spec
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    fn n_groups(&self) -> usize {
        self.groups.len()
    }

    /// Offset of `alpha[1]` in the parameter vector.
    fn alpha_offset(&self) -> usize {
        match self.spec.pooling {
            Pooling::Independent => 0,
            Pooling::FixedScale(_) => 1,
            Pooling::EstimatedScale(_) => 2,
        }
    }

    /// Success probability of each group from constrained values.
    fn group_probabilities(&self, constrained: &[f64]) -> Vec<f64> {
        let offset = self.alpha_offset();
        let values = &constrained[offset..offset + self.n_groups()];
        match self.spec.pooling {
            Pooling::Independent => values.to_vec(),
            _ => values.iter().map(|&a| self.spec.link.inverse(a)).collect(),
        }
    }

    fn log_lik_groups(&self, theta: &[f64], grad: Option<&mut [f64]>, jacobian: bool) -> f64 {
        let mut lp = 0.0;
        match self.spec.pooling {
            Pooling::Independent => {
                let jac = if jacobian { 1.0 } else { 0.0 };
                let mut grad = grad;
                for j in 0..self.n_groups() {
                    let (s, f) = (self.successes[j] + jac, self.failures[j] + jac);
                    let eta = theta[j];
                    lp += s * math::log_inv_logit(eta) + f * math::log1m_inv_logit(eta);
                    if let Some(g) = grad.as_deref_mut() {
                        g[j] += s - (s + f) * math::inv_logit(eta);
                    }
                }
            }
            _ => {
                let offset = self.alpha_offset();
                let link = self.spec.link;
                let mut grad = grad;
                for j in 0..self.n_groups() {
                    let eta = theta[offset + j];
                    let (s, f) = (self.successes[j], self.failures[j]);
                    if s > 0.0 {
                        lp += s * link.log_success(eta);
                    }
                    if f > 0.0 {
                        lp += f * link.log_failure(eta);
                    }
                    if let Some(g) = grad.as_deref_mut() {
                        g[offset + j] += link.score(s, f, eta);
                    }
                }
            }
        }
        lp
    }

    /// Prior terms; the hierarchy on `alpha` uses `ln tau` directly so that
    /// `tau` never has to be exponentiated before it is divided out.
    fn log_prior(&self, theta: &[f64], grad: Option<&mut [f64]>, jacobian: bool) -> f64 {
        let (mu, log_tau, tau_prior) = match self.spec.pooling {
            Pooling::Independent => return 0.0,
            Pooling::FixedScale(tau) => (theta[0], tau.ln(), None),
            Pooling::EstimatedScale(prior) => (theta[0], theta[1], Some(prior)),
        };
        let offset = self.alpha_offset();
        let inv_tau = (-log_tau).exp();
        let prior_var = POPULATION_PRIOR_SD * POPULATION_PRIOR_SD;

        let mut lp = -0.5 * mu * mu / prior_var;
        let mut d_mu = -mu / prior_var;
        let mut d_log_tau = 0.0;
        let mut grad = grad;
        for j in 0..self.n_groups() {
            let z = (theta[offset + j] - mu) * inv_tau;
            lp += -0.5 * z * z - log_tau;
            d_mu += z * inv_tau;
            d_log_tau += z * z - 1.0;
            if let Some(g) = grad.as_deref_mut() {
                g[offset + j] += -z * inv_tau;
            }
        }
        if let Some(prior) = tau_prior {
            let tau = log_tau.exp();
            lp += prior.log_density(tau);
            d_log_tau += prior.d_log_tau(tau);
            if jacobian {
                lp += log_tau;
                d_log_tau += 1.0;
            }
        }
        if let Some(g) = grad {
            g[0] += d_mu;
            if tau_prior.is_some() {
                g[1] += d_log_tau;
            }
        }
        lp
    }
}

impl LogDensity for SaveRateModel {
    fn dim(&self) -> usize {
        self.alpha_offset() + self.n_groups()
    }

    fn param_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.dim());
        let group_name = match self.spec.pooling {
            Pooling::Independent => "p",
            Pooling::FixedScale(_) => {
                names.push("mu".to_string());
                "alpha"
            }
            Pooling::EstimatedScale(_) => {
                names.push("mu".to_string());
                names.push("tau".to_string());
                "alpha"
            }
        };
        names.extend((1..=self.n_groups()).map(|j| format!("{}[{}]", group_name, j)));
        names
    }

    fn log_density(&self, theta: &[f64], jacobian: bool) -> f64 {
        let lp = self.log_prior(theta, None, jacobian) + self.log_lik_groups(theta, None, jacobian);
        if lp.is_nan() {
            f64::NEG_INFINITY
        } else {
            lp
        }
    }

    fn gradient(&self, theta: &[f64], jacobian: bool, grad: &mut [f64]) -> f64 {
        grad.iter_mut().for_each(|g| *g = 0.0);
        let lp = self.log_prior(theta, Some(&mut *grad), jacobian)
            + self.log_lik_groups(theta, Some(&mut *grad), jacobian);
        if lp.is_nan() {
            f64::NEG_INFINITY
        } else {
            lp
        }
    }

    fn constrain(&self, theta: &[f64]) -> Vec<f64> {
        let mut out = theta.to_vec();
        match self.spec.pooling {
            Pooling::Independent => out.iter_mut().for_each(|v| *v = math::inv_logit(*v)),
            Pooling::EstimatedScale(_) => out[1] = theta[1].exp(),
            Pooling::FixedScale(_) => {}
        }
        out
    }

    fn unconstrain(&self, constrained: &[f64]) -> Vec<f64> {
        let mut out = constrained.to_vec();
        match self.spec.pooling {
            Pooling::Independent => out.iter_mut().for_each(|v| *v = math::logit(*v)),
            Pooling::EstimatedScale(_) => out[1] = constrained[1].ln(),
            Pooling::FixedScale(_) => {}
        }
        out
    }

    fn generated_names(&self) -> Vec<String> {
        match self.spec.pooling {
            // p is already a parameter
            Pooling::Independent => Vec::new(),
            _ => (1..=self.n_groups()).map(|j| format!("p[{}]", j)).collect(),
        }
    }

    fn generated(&self, constrained: &[f64]) -> Vec<f64> {
        match self.spec.pooling {
            Pooling::Independent => Vec::new(),
            _ => self.group_probabilities(constrained),
        }
    }

    fn has_log_lik(&self) -> bool {
        self.spec.log_lik
    }

    fn n_obs(&self) -> usize {
        self.shot_groups.len()
    }

    fn log_lik(&self, constrained: &[f64], out: &mut [f64]) {
        let offset = self.alpha_offset();
        for (i, (&g, &saved)) in self.shot_groups.iter().zip(&self.shot_outcomes).enumerate() {
            let v = constrained[offset + g];
            out[i] = match self.spec.pooling {
                Pooling::Independent if saved => v.ln(),
                Pooling::Independent => (1.0 - v).ln(),
                _ if saved => self.spec.link.log_success(v),
                _ => self.spec.link.log_failure(v),
            };
        }
    }

    fn data_fingerprint(&self) -> String {
        self.fingerprint.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Shot;
    use crate::model::finite_difference_gradient;

    fn data() -> SaveDataset {
        let mut shots = Vec::new();
        for (group, saves, total) in [(0usize, 7, 10), (1, 2, 6), (2, 9, 9)] {
            for k in 0..total {
                shots.push(Shot {
                    group,
                    saved: k < saves,
                });
            }
        }
        SaveDataset::new(vec!["a".into(), "b".into(), "c".into()], shots).unwrap()
    }

    fn check_gradient(spec: SaveRateSpec, theta: &[f64]) {
        let model = SaveRateModel::new(spec, &data()).unwrap();
        for jacobian in [true, false] {
            let mut grad = vec![0.0; model.dim()];
            let lp = model.gradient(theta, jacobian, &mut grad);
            assert!((lp - model.log_density(theta, jacobian)).abs() < 1e-10);
            let fd = finite_difference_gradient(&model, theta, jacobian);
            for (a, b) in grad.iter().zip(&fd) {
                assert!((a - b).abs() < 1e-4, "analytic {} vs numeric {}", a, b);
            }
        }
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        check_gradient(SaveRateSpec::independent(), &[0.3, -0.8, 1.7]);
        check_gradient(
            SaveRateSpec::fixed_scale(0.4, Link::Logit),
            &[0.5, 0.2, -0.3, 1.1],
        );
        check_gradient(
            SaveRateSpec::fixed_scale(0.8, Link::Probit),
            &[0.5, 0.2, -0.3, 1.1],
        );
        check_gradient(
            SaveRateSpec::estimated_scale(ScalePrior::HalfNormal(1.0), Link::Logit),
            &[0.4, -0.5, 0.1, -0.2, 0.9],
        );
        check_gradient(
            SaveRateSpec::estimated_scale(ScalePrior::Flat, Link::Probit),
            &[0.4, -0.5, 0.1, -0.2, 0.9],
        );
        check_gradient(
            SaveRateSpec::estimated_scale(ScalePrior::Exponential(2.0), Link::Logit),
            &[0.4, 0.3, 0.1, -0.2, 0.9],
        );
    }

    #[test]
    fn test_param_names_and_constrain() {
        let spec = SaveRateSpec::estimated_scale(ScalePrior::Flat, Link::Logit);
        let model = SaveRateModel::new(spec, &data()).unwrap();
        assert_eq!(
            model.param_names(),
            vec!["mu", "tau", "alpha[1]", "alpha[2]", "alpha[3]"]
        );
        let theta = [0.1, 0.0, 0.2, 0.3, 0.4];
        let constrained = model.constrain(&theta);
        assert!((constrained[1] - 1.0).abs() < 1e-12);
        let back = model.unconstrain(&constrained);
        assert!(back.iter().zip(&theta).all(|(a, b)| (a - b).abs() < 1e-12));
    }

    #[test]
    fn test_log_lik_sums_to_likelihood() {
        let mut spec = SaveRateSpec::fixed_scale(0.5, Link::Logit);
        spec.log_lik = true;
        let model = SaveRateModel::new(spec, &data()).unwrap();
        let constrained = [0.0, 0.5, -0.5, 2.0];
        let mut out = vec![0.0; model.n_obs()];
        model.log_lik(&constrained, &mut out);
        let expected = 7.0 * math::log_inv_logit(0.5)
            + 3.0 * math::log1m_inv_logit(0.5)
            + 2.0 * math::log_inv_logit(-0.5)
            + 4.0 * math::log1m_inv_logit(-0.5)
            + 9.0 * math::log_inv_logit(2.0);
        assert!((out.iter().sum::<f64>() - expected).abs() < 1e-10);
    }

    #[test]
    fn test_flat_prior_density_unbounded_at_zero_scale() {
        let spec = SaveRateSpec::estimated_scale(ScalePrior::Flat, Link::Logit);
        let model = SaveRateModel::new(spec, &data()).unwrap();
        let at = |log_tau: f64| model.log_density(&[1.0, log_tau, 1.0, 1.0, 1.0], false);
        assert!(at(-10.0) > at(-1.0));
        assert!(at(-50.0) > at(-10.0));
    }

    #[test]
    fn test_rejects_non_positive_scale() {
        let spec = SaveRateSpec::fixed_scale(0.0, Link::Logit);
        assert!(matches!(
            SaveRateModel::new(spec, &data()),
            Err(Error::InvalidConfig(_))
        ));
    }
}
