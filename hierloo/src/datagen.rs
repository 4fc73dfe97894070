//! Synthetic datasets with known truth.
//!
//! Every generator is driven by an explicit seed through `ChaCha20Rng`, so
//! the same configuration and seed always reproduce the same dataset.

use crate::data::{PollDataset, SaveDataset, Shot};
use crate::error::{Error, Result};
use crate::math;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Binomial, Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// True parameter values, keyed by the model's parameter names.
pub type Truth = BTreeMap<String, f64>;

/// A generated dataset together with the values that generated it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Simulated<T> {
    pub data: T,
    pub truth: Truth,
    pub seed: u64,
}

/// Settings for simulated keepers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveRateConfig {
    pub groups: Vec<String>,
    /// Population mean save logit
    pub mu: f64,
    /// Spread of keeper logits around `mu`
    pub tau: f64,
    pub min_shots: u32,
    pub max_shots: u32,
}

impl Default for SaveRateConfig {
    fn default() -> Self {
        Self {
            groups: [
                "alisson", "courtois", "donnarumma", "maignan", "neuer", "oblak", "sommer",
                "terstegen",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            mu: math::logit(0.7),
            tau: 0.5,
            min_shots: 20,
            max_shots: 60,
        }
    }
}

impl SaveRateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(Error::InvalidConfig("at least one group is required".to_string()));
        }
        if self.min_shots > self.max_shots {
            return Err(Error::InvalidConfig(format!(
                "min_shots ({}) exceeds max_shots ({})",
                self.min_shots, self.max_shots
            )));
        }
        if !(self.tau >= 0.0 && self.tau.is_finite()) || !self.mu.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "mu must be finite and tau non-negative, got mu={} tau={}",
                self.mu, self.tau
            )));
        }
        Ok(())
    }
}

/// Draw keeper rates, shot counts and outcomes; shots are shuffled.
pub fn simulate_saves(config: &SaveRateConfig, seed: u64) -> Result<Simulated<SaveDataset>> {
    config.validate()?;
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let normal = Normal::new(config.mu, config.tau)
        .map_err(|e| Error::InvalidConfig(format!("group prior: {}", e)))?;

    let mut truth = Truth::new();
    truth.insert("mu".to_string(), config.mu);
    truth.insert("tau".to_string(), config.tau);

    let mut probabilities = Vec::with_capacity(config.groups.len());
    let mut counts = Vec::with_capacity(config.groups.len());
    for j in 0..config.groups.len() {
        let alpha = normal.sample(&mut rng);
        let p = math::inv_logit(alpha);
        truth.insert(format!("alpha[{}]", j + 1), alpha);
        truth.insert(format!("p[{}]", j + 1), p);
        probabilities.push(p);
        counts.push(rng.gen_range(config.min_shots..=config.max_shots));
    }

    let data = draw_shots(&config.groups, &probabilities, &counts, &mut rng)?;
    Ok(Simulated { data, truth, seed })
}

/// New shots for the same keepers and true rates, e.g. to score held-out
/// predictive accuracy.
pub fn heldout_saves(
    sim: &Simulated<SaveDataset>,
    shots_per_group: u32,
    seed: u64,
) -> Result<SaveDataset> {
    let groups = &sim.data.groups;
    let probabilities = (1..=groups.len())
        .map(|j| {
            sim.truth.get(&format!("p[{}]", j)).copied().ok_or_else(|| {
                Error::InvalidConfig(format!("simulation truth has no p[{}]", j))
            })
        })
        .collect::<Result<Vec<f64>>>()?;
    let counts = vec![shots_per_group; groups.len()];
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    draw_shots(groups, &probabilities, &counts, &mut rng)
}

fn draw_shots(
    groups: &[String],
    probabilities: &[f64],
    counts: &[u32],
    rng: &mut ChaCha20Rng,
) -> Result<SaveDataset> {
    let mut shots = Vec::with_capacity(counts.iter().sum::<u32>() as usize);
    for (group, (&p, &n)) in probabilities.iter().zip(counts).enumerate() {
        for _ in 0..n {
            shots.push(Shot {
                group,
                saved: rng.gen_bool(p),
            });
        }
    }
    shots.shuffle(rng);
    SaveDataset::new(groups.to_vec(), shots)
}

/// Settings for a simulated polling series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub n_steps: usize,
    pub trials_per_step: u32,
    /// Baseline support on the logit scale
    pub mu: f64,
    /// Stationary sd of the latent walk
    pub sigma: f64,
    /// Decay time of the walk's correlation
    pub length_scale: f64,
    /// Gaps between polls are uniform in `1..=max_gap`
    pub max_gap: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            n_steps: 40,
            trials_per_step: 500,
            mu: 0.0,
            sigma: 0.3,
            length_scale: 10.0,
            max_gap: 3,
        }
    }
}

impl PollConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_steps == 0 || self.max_gap == 0 || self.trials_per_step == 0 {
            return Err(Error::InvalidConfig(
                "n_steps, max_gap and trials_per_step must be positive".to_string(),
            ));
        }
        if !(self.sigma > 0.0 && self.length_scale > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "sigma and length_scale must be positive, got {} and {}",
                self.sigma, self.length_scale
            )));
        }
        Ok(())
    }
}

/// Simulate the latent walk and binomial poll counts.
pub fn simulate_polls(config: &PollConfig, seed: u64) -> Result<Simulated<PollDataset>> {
    config.validate()?;
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let std_normal = Normal::new(0.0, 1.0)
        .map_err(|e| Error::InvalidConfig(format!("standard normal: {}", e)))?;

    let mut truth = Truth::new();
    truth.insert("mu".to_string(), config.mu);
    truth.insert("sigma".to_string(), config.sigma);

    let mut times: Vec<f64> = Vec::with_capacity(config.n_steps);
    let mut successes: Vec<u32> = Vec::with_capacity(config.n_steps);
    let mut x = config.sigma * std_normal.sample(&mut rng);
    let mut time = 0.0;
    for t in 0..config.n_steps {
        if t > 0 {
            time += rng.gen_range(1..=config.max_gap) as f64;
            let rho = (-(time - times[t - 1]) / config.length_scale).exp();
            let sd = config.sigma * (1.0 - rho * rho).sqrt();
            x = rho * x + sd * std_normal.sample(&mut rng);
        }
        let p = math::inv_logit(config.mu + x);
        let binomial = Binomial::new(config.trials_per_step as u64, p)
            .map_err(|e| Error::InvalidConfig(format!("binomial p={}: {}", p, e)))?;
        times.push(time);
        successes.push(binomial.sample(&mut rng) as u32);
        truth.insert(format!("x[{}]", t + 1), x);
        truth.insert(format!("p[{}]", t + 1), p);
    }

    let trials = vec![config.trials_per_step; config.n_steps];
    let data = PollDataset::new(times, successes, trials)?;
    Ok(Simulated { data, truth, seed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saves_reproducible_for_seed() {
        let config = SaveRateConfig::default();
        let a = simulate_saves(&config, 42).unwrap();
        let b = simulate_saves(&config, 42).unwrap();
        assert_eq!(a.data, b.data);
        assert_eq!(a.truth, b.truth);
        assert_eq!(a.data.counts(), b.data.counts());

        let c = simulate_saves(&config, 43).unwrap();
        assert_ne!(a.data, c.data);
    }

    #[test]
    fn test_saves_shot_counts_in_range() {
        let config = SaveRateConfig {
            min_shots: 5,
            max_shots: 9,
            ..SaveRateConfig::default()
        };
        let sim = simulate_saves(&config, 7).unwrap();
        for (s, f) in sim.data.counts() {
            assert!((5..=9).contains(&(s + f)));
        }
        assert_eq!(sim.data.n_groups(), config.groups.len());
    }

    #[test]
    fn test_heldout_uses_same_groups() {
        let sim = simulate_saves(&SaveRateConfig::default(), 1).unwrap();
        let heldout = heldout_saves(&sim, 30, 2).unwrap();
        assert_eq!(heldout.groups, sim.data.groups);
        assert!(heldout.counts().iter().all(|(s, f)| s + f == 30));
    }

    #[test]
    fn test_invalid_save_config() {
        let config = SaveRateConfig {
            min_shots: 10,
            max_shots: 2,
            ..SaveRateConfig::default()
        };
        assert!(matches!(
            simulate_saves(&config, 0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_polls_reproducible_and_ordered() {
        let config = PollConfig::default();
        let a = simulate_polls(&config, 9).unwrap();
        let b = simulate_polls(&config, 9).unwrap();
        assert_eq!(a.data, b.data);
        assert_eq!(a.data.len(), config.n_steps);
        assert!(a.data.times.windows(2).all(|w| w[1] > w[0]));
        assert!(a.data.successes.iter().all(|&y| y <= config.trials_per_step));
    }
}
