//! Stan program generation
//!
//! Emits the same models the native engine evaluates, with matching
//! parameter and generated-quantity names so that CmdStan output can be
//! read back into a [`crate::fit::Fit`] column for column.

use crate::error::{Error, Result};
use crate::model::{Link, ModelSpec, Pooling, PollingSpec, SaveRateSpec, ScalePrior, POPULATION_PRIOR_SD};

/// Generate a complete Stan program for `spec`.
pub fn generate_stan(spec: &ModelSpec) -> Result<String> {
    match spec {
        ModelSpec::SaveRate(s) => {
            s.validate()?;
            Ok(save_rate_program(s))
        }
        ModelSpec::Polling(s) => {
            if !(s.length_scale > 0.0 && s.length_scale.is_finite()) {
                return Err(Error::InvalidConfig(format!(
                    "length_scale must be positive, got {}",
                    s.length_scale
                )));
            }
            Ok(polling_program(s))
        }
    }
}

fn save_rate_program(spec: &SaveRateSpec) -> String {
    let mut stan = format!("// {}\n", spec.name());

    stan.push_str("data {\n");
    stan.push_str("  int<lower=1> N;\n");
    stan.push_str("  int<lower=1> J;\n");
    stan.push_str("  array[N] int<lower=1, upper=J> group;\n");
    stan.push_str("  array[N] int<lower=0, upper=1> y;\n");
    if let Pooling::FixedScale(_) = spec.pooling {
        stan.push_str("  real<lower=0> tau;\n");
    }
    stan.push_str("}\n");

    stan.push_str("parameters {\n");
    match spec.pooling {
        Pooling::Independent => {
            stan.push_str("  vector<lower=0, upper=1>[J] p;\n");
        }
        Pooling::FixedScale(_) => {
            stan.push_str("  real mu;\n");
            stan.push_str("  vector[J] alpha;\n");
        }
        Pooling::EstimatedScale(_) => {
            stan.push_str("  real mu;\n");
            stan.push_str("  real<lower=0> tau;\n");
            stan.push_str("  vector[J] alpha;\n");
        }
    }
    stan.push_str("}\n");

    stan.push_str("model {\n");
    let success = match spec.pooling {
        Pooling::Independent => {
            stan.push_str("  p ~ beta(1, 1);\n");
            stan.push_str("  y ~ bernoulli(p[group]);\n");
            "p[group[i]]".to_string()
        }
        Pooling::FixedScale(_) | Pooling::EstimatedScale(_) => {
            stan.push_str(&format!("  mu ~ normal(0, {});\n", POPULATION_PRIOR_SD));
            if let Pooling::EstimatedScale(prior) = spec.pooling {
                match prior {
                    ScalePrior::Flat => {}
                    ScalePrior::HalfNormal(s) => {
                        stan.push_str(&format!("  tau ~ normal(0, {});\n", s));
                    }
                    ScalePrior::Exponential(rate) => {
                        stan.push_str(&format!("  tau ~ exponential({});\n", rate));
                    }
                }
            }
            stan.push_str("  alpha ~ normal(mu, tau);\n");
            match spec.link {
                Link::Logit => {
                    stan.push_str("  y ~ bernoulli_logit(alpha[group]);\n");
                    "inv_logit(alpha[group[i]])".to_string()
                }
                Link::Probit => {
                    stan.push_str("  y ~ bernoulli(Phi(alpha[group]));\n");
                    "Phi(alpha[group[i]])".to_string()
                }
            }
        }
    };
    stan.push_str("}\n");

    let hierarchical = !matches!(spec.pooling, Pooling::Independent);
    if hierarchical || spec.log_lik {
        stan.push_str("generated quantities {\n");
        if hierarchical {
            let inverse = match spec.link {
                Link::Logit => "inv_logit(alpha)",
                Link::Probit => "Phi(alpha)",
            };
            stan.push_str(&format!("  vector[J] p = {};\n", inverse));
        }
        if spec.log_lik {
            stan.push_str("  vector[N] log_lik;\n");
            stan.push_str("  for (i in 1:N) {\n");
            stan.push_str(&format!(
                "    log_lik[i] = bernoulli_lpmf(y[i] | {});\n",
                success
            ));
            stan.push_str("  }\n");
        }
        stan.push_str("}\n");
    }
    stan
}

fn polling_program(spec: &PollingSpec) -> String {
    let mut stan = format!("// {}\n", spec.name());

    stan.push_str("data {\n");
    stan.push_str("  int<lower=1> T;\n");
    stan.push_str("  vector[T] time;\n");
    stan.push_str("  array[T] int<lower=0> y;\n");
    stan.push_str("  array[T] int<lower=0> n;\n");
    stan.push_str("  real<lower=0> length_scale;\n");
    stan.push_str("}\n");

    stan.push_str("parameters {\n");
    stan.push_str("  real mu;\n");
    stan.push_str("  real<lower=0> sigma;\n");
    stan.push_str("  vector[T] x;\n");
    stan.push_str("}\n");

    stan.push_str("model {\n");
    stan.push_str(&format!("  mu ~ normal(0, {});\n", POPULATION_PRIOR_SD));
    stan.push_str("  sigma ~ normal(0, 1);\n");
    stan.push_str("  x[1] ~ normal(0, sigma);\n");
    stan.push_str("  for (t in 2:T) {\n");
    stan.push_str("    real rho = exp(-(time[t] - time[t - 1]) / length_scale);\n");
    stan.push_str("    x[t] ~ normal(rho * x[t - 1], sigma * sqrt(1 - square(rho)));\n");
    stan.push_str("  }\n");
    stan.push_str("  y ~ binomial_logit(n, mu + x);\n");
    stan.push_str("}\n");

    stan.push_str("generated quantities {\n");
    stan.push_str("  vector[T] p = inv_logit(mu + x);\n");
    if spec.log_lik {
        stan.push_str("  vector[T] log_lik;\n");
        stan.push_str("  for (t in 1:T) {\n");
        stan.push_str("    log_lik[t] = binomial_logit_lpmf(y[t] | n[t], mu + x[t]);\n");
        stan.push_str("  }\n");
    }
    stan.push_str("}\n");
    stan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_scale_declares_tau_as_data() {
        let spec = ModelSpec::SaveRate(SaveRateSpec::fixed_scale(0.5, Link::Logit));
        let stan = generate_stan(&spec).unwrap();
        let data_block = &stan[stan.find("data {").unwrap()..stan.find("parameters {").unwrap()];
        assert!(data_block.contains("real<lower=0> tau;"));
        assert!(stan.contains("bernoulli_logit(alpha[group])"));
        assert!(!stan.contains("log_lik"));
    }

    #[test]
    fn test_flat_prior_has_no_tau_statement() {
        let spec = ModelSpec::SaveRate(SaveRateSpec::estimated_scale(ScalePrior::Flat, Link::Probit));
        let stan = generate_stan(&spec).unwrap();
        assert!(!stan.contains("tau ~"));
        assert!(stan.contains("Phi(alpha[group])"));
        assert!(stan.contains("vector[J] p = Phi(alpha);"));
    }

    #[test]
    fn test_log_lik_block() {
        let spec = ModelSpec::SaveRate(SaveRateSpec::independent()).with_log_lik();
        let stan = generate_stan(&spec).unwrap();
        assert!(stan.contains("log_lik[i] = bernoulli_lpmf(y[i] | p[group[i]]);"));

        let spec = ModelSpec::Polling(PollingSpec::new(10.0)).with_log_lik();
        let stan = generate_stan(&spec).unwrap();
        assert!(stan.contains("binomial_logit_lpmf(y[t] | n[t], mu + x[t])"));
    }

    #[test]
    fn test_invalid_spec_rejected() {
        let spec = ModelSpec::SaveRate(SaveRateSpec::fixed_scale(-1.0, Link::Logit));
        assert!(matches!(generate_stan(&spec), Err(Error::InvalidConfig(_))));
    }
}
