//! Hamiltonian Monte Carlo sampler
//!
//! Static-trajectory HMC with a diagonal metric. Warm-up follows the usual
//! three-stage schedule: a fast interval that only tunes the step size, a
//! slow window that also estimates the metric from the draws, and a final
//! fast interval. Step size is tuned by dual averaging (Hoffman & Gelman
//! 2014) towards `adapt_delta`.
//!
//! Divergent transitions are counted and rejected, nothing more. Whether a
//! fit is trustworthy is left to [`crate::diagnostics::mcmc`].

use crate::error::{Error, Result};
use crate::fit::{Draws, Fit, FitOutput, LogLikMatrix, Method};
use crate::model::{BoundModel, LogDensity};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Energy error beyond which a transition counts as divergent.
const MAX_ENERGY_ERROR: f64 = 1000.0;

/// Configuration for MCMC sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    /// Number of chains, run one after another
    pub num_chains: usize,
    /// Warm-up iterations per chain (discarded)
    pub num_warmup: usize,
    /// Kept iterations per chain
    pub num_samples: usize,
    /// Chain `c` uses seed `seed + c`
    pub seed: u64,
    /// Target acceptance rate for step size adaptation
    pub adapt_delta: f64,
    /// Trajectory length in units of the metric
    pub integration_time: f64,
    pub max_leapfrog: usize,
    /// Initial values are drawn uniformly from `(-init_radius, init_radius)`
    /// on the unconstrained scale; 0 starts at the origin
    pub init_radius: f64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            num_chains: 1,
            num_warmup: 1000,
            num_samples: 1000,
            seed: 1234,
            adapt_delta: 0.8,
            integration_time: 2.0,
            max_leapfrog: 64,
            init_radius: 2.0,
        }
    }
}

impl SampleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_chains == 0 || self.num_samples == 0 {
            return Err(Error::InvalidConfig(
                "num_chains and num_samples must be positive".to_string(),
            ));
        }
        if !(self.adapt_delta > 0.0 && self.adapt_delta < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "adapt_delta must lie in (0, 1), got {}",
                self.adapt_delta
            )));
        }
        if !(self.integration_time > 0.0) || self.max_leapfrog == 0 {
            return Err(Error::InvalidConfig(
                "integration_time and max_leapfrog must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Draw posterior samples for a bound model.
pub fn sample(model: &BoundModel, config: &SampleConfig) -> Result<Fit> {
    config.validate()?;
    let spec = model.spec();
    info!(
        model = %spec.name(),
        chains = config.num_chains,
        warmup = config.num_warmup,
        samples = config.num_samples,
        "sampling"
    );

    let mut chains = Vec::with_capacity(config.num_chains);
    let mut lps = Vec::with_capacity(config.num_chains);
    let mut log_lik_rows = Vec::new();
    let mut divergent = 0;
    let mut step_sizes = Vec::with_capacity(config.num_chains);

    for chain_id in 0..config.num_chains {
        let seed = config.seed.wrapping_add(chain_id as u64);
        let chain = run_chain(model, config, seed)?;
        debug!(
            chain = chain_id + 1,
            step_size = chain.step_size,
            divergent = chain.divergent,
            "chain finished"
        );
        divergent += chain.divergent;
        step_sizes.push(chain.step_size);

        let mut rows = Vec::with_capacity(chain.thetas.len());
        for theta in &chain.thetas {
            let mut row = model.constrain(theta);
            let generated = model.generated(&row);
            if model.has_log_lik() {
                let mut ll = vec![0.0; model.n_obs()];
                model.log_lik(&row, &mut ll);
                log_lik_rows.push(ll);
            }
            row.extend(generated);
            rows.push(row);
        }
        chains.push(rows);
        lps.push(chain.lp);
    }

    let mut columns = model.param_names();
    columns.extend(model.generated_names());
    let log_lik = model
        .has_log_lik()
        .then(|| LogLikMatrix::new(log_lik_rows, model.n_obs(), model.data_fingerprint()));

    info!(model = %spec.name(), divergent, "sampling complete");
    Ok(Fit::new(
        spec,
        Method::Sample,
        "native-hmc",
        columns,
        model.dim(),
        FitOutput::Draws(Draws {
            chains,
            lp: lps,
            divergent,
            step_sizes,
        }),
        log_lik,
    ))
}

struct ChainOutput {
    thetas: Vec<Vec<f64>>,
    lp: Vec<f64>,
    divergent: usize,
    step_size: f64,
}

/// Phase-space point with cached log density and gradient.
#[derive(Clone)]
struct State {
    theta: Vec<f64>,
    lp: f64,
    grad: Vec<f64>,
}

impl State {
    fn at(model: &BoundModel, theta: Vec<f64>) -> Self {
        let mut grad = vec![0.0; theta.len()];
        let lp = model.gradient(&theta, true, &mut grad);
        Self { theta, lp, grad }
    }

    fn is_finite(&self) -> bool {
        self.lp.is_finite() && self.grad.iter().all(|g| g.is_finite())
    }
}

/// Dual averaging step size adaptation.
struct DualAveraging {
    mu: f64,
    target: f64,
    counter: f64,
    s_bar: f64,
    x_bar: f64,
}

impl DualAveraging {
    const GAMMA: f64 = 0.05;
    const T0: f64 = 10.0;
    const KAPPA: f64 = 0.75;

    fn new(step_size: f64, target: f64) -> Self {
        Self {
            mu: (10.0 * step_size).ln(),
            target,
            counter: 0.0,
            s_bar: 0.0,
            x_bar: 0.0,
        }
    }

    fn update(&mut self, accept_prob: f64) -> f64 {
        self.counter += 1.0;
        let eta = 1.0 / (self.counter + Self::T0);
        self.s_bar = (1.0 - eta) * self.s_bar + eta * (self.target - accept_prob);
        let x = self.mu - self.s_bar * self.counter.sqrt() / Self::GAMMA;
        let weight = self.counter.powf(-Self::KAPPA);
        self.x_bar = weight * x + (1.0 - weight) * self.x_bar;
        x.exp()
    }

    fn final_step_size(&self) -> f64 {
        self.x_bar.exp()
    }
}

/// Running variance for metric estimation (Welford).
struct WelfordVariance {
    n: f64,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl WelfordVariance {
    fn new(dim: usize) -> Self {
        Self {
            n: 0.0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
        }
    }

    fn add(&mut self, x: &[f64]) {
        self.n += 1.0;
        for (i, &v) in x.iter().enumerate() {
            let delta = v - self.mean[i];
            self.mean[i] += delta / self.n;
            self.m2[i] += delta * (v - self.mean[i]);
        }
    }

    /// Sample variance shrunk towards 1e-3 like Stan's regularization.
    fn regularized(&self) -> Vec<f64> {
        let n = self.n;
        self.m2
            .iter()
            .map(|m2| {
                let var = m2 / (n - 1.0);
                (n / (n + 5.0)) * var + 1e-3 * (5.0 / (n + 5.0))
            })
            .collect()
    }
}

/// Warm-up window boundaries: `[0, init_end)` fast, `[init_end, slow_end)`
/// slow, `[slow_end, num_warmup)` fast.
fn warmup_windows(num_warmup: usize) -> (usize, usize) {
    if num_warmup < 150 {
        // too short for metric estimation
        return (num_warmup, num_warmup);
    }
    let init_end = 75;
    let slow_end = num_warmup - 50;
    (init_end, slow_end)
}

fn initial_state(model: &BoundModel, radius: f64, rng: &mut ChaCha20Rng) -> Result<State> {
    const MAX_ATTEMPTS: usize = 100;
    for _ in 0..MAX_ATTEMPTS {
        let theta: Vec<f64> = (0..model.dim())
            .map(|_| {
                if radius > 0.0 {
                    rng.gen_range(-radius..radius)
                } else {
                    0.0
                }
            })
            .collect();
        let state = State::at(model, theta);
        if state.is_finite() {
            return Ok(state);
        }
        if radius <= 0.0 {
            break;
        }
    }
    Err(Error::InvalidInit(format!(
        "no finite log density found for {}",
        model.spec().name()
    )))
}

fn kinetic(momentum: &[f64], inv_metric: &[f64]) -> f64 {
    0.5 * momentum
        .iter()
        .zip(inv_metric)
        .map(|(p, m)| p * p * m)
        .sum::<f64>()
}

fn draw_momentum(inv_metric: &[f64], rng: &mut ChaCha20Rng) -> Vec<f64> {
    inv_metric
        .iter()
        .map(|m| {
            let z: f64 = rng.sample(StandardNormal);
            z / m.sqrt()
        })
        .collect()
}

/// Leapfrog integrate from `start`; returns the end state and its
/// Hamiltonian (`None` if the trajectory left the finite region).
fn leapfrog(
    model: &BoundModel,
    start: &State,
    momentum: &mut [f64],
    inv_metric: &[f64],
    step_size: f64,
    steps: usize,
) -> Option<(State, f64)> {
    let mut state = start.clone();
    for (p, g) in momentum.iter_mut().zip(&state.grad) {
        *p += 0.5 * step_size * g;
    }
    for step in 0..steps {
        for i in 0..state.theta.len() {
            state.theta[i] += step_size * inv_metric[i] * momentum[i];
        }
        state.lp = model.gradient(&state.theta, true, &mut state.grad);
        if !state.is_finite() {
            return None;
        }
        let scale = if step + 1 == steps { 0.5 } else { 1.0 };
        for (p, g) in momentum.iter_mut().zip(&state.grad) {
            *p += scale * step_size * g;
        }
    }
    let hamiltonian = -state.lp + kinetic(momentum, inv_metric);
    Some((state, hamiltonian))
}

/// Starting step size: double or halve until the one-step acceptance
/// crosses 0.8.
fn find_reasonable_step_size(
    model: &BoundModel,
    state: &State,
    inv_metric: &[f64],
    rng: &mut ChaCha20Rng,
) -> f64 {
    let mut step_size: f64 = 1.0;
    let momentum = draw_momentum(inv_metric, rng);
    let h0 = -state.lp + kinetic(&momentum, inv_metric);
    let log_accept = |eps: f64| -> f64 {
        let mut p = momentum.clone();
        match leapfrog(model, state, &mut p, inv_metric, eps, 1) {
            Some((_, h)) => h0 - h,
            None => f64::NEG_INFINITY,
        }
    };
    let direction = if log_accept(step_size) > 0.8f64.ln() {
        1.0
    } else {
        -1.0
    };
    for _ in 0..50 {
        let la = log_accept(step_size);
        let crossed = if direction > 0.0 {
            !(la > 0.8f64.ln())
        } else {
            la > 0.8f64.ln()
        };
        if crossed {
            break;
        }
        step_size *= 2f64.powf(direction);
    }
    step_size.clamp(1e-8, 1e3)
}

fn run_chain(model: &BoundModel, config: &SampleConfig, seed: u64) -> Result<ChainOutput> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let dim = model.dim();
    let mut state = initial_state(model, config.init_radius, &mut rng)?;
    let mut inv_metric = vec![1.0; dim];
    let mut step_size = find_reasonable_step_size(model, &state, &inv_metric, &mut rng);
    let mut adapt = DualAveraging::new(step_size, config.adapt_delta);
    let (init_end, slow_end) = warmup_windows(config.num_warmup);
    let mut variance = WelfordVariance::new(dim);

    let total = config.num_warmup + config.num_samples;
    let mut thetas = Vec::with_capacity(config.num_samples);
    let mut lp = Vec::with_capacity(config.num_samples);
    let mut divergent = 0;

    for iter in 0..total {
        let warmup = iter < config.num_warmup;
        // jitter step size by +-10% to avoid periodic trajectories
        let eps = step_size * rng.gen_range(0.9..1.1);
        let steps = ((config.integration_time / eps).ceil() as usize).clamp(1, config.max_leapfrog);

        let mut momentum = draw_momentum(&inv_metric, &mut rng);
        let h0 = -state.lp + kinetic(&momentum, &inv_metric);
        let proposal = leapfrog(model, &state, &mut momentum, &inv_metric, eps, steps);

        let accept_prob = match proposal {
            Some((next, h1)) if h1 - h0 < MAX_ENERGY_ERROR => {
                let prob = (h0 - h1).exp().min(1.0);
                if rng.gen::<f64>() < prob {
                    state = next;
                }
                prob
            }
            _ => {
                if !warmup {
                    divergent += 1;
                }
                0.0
            }
        };

        if warmup {
            step_size = adapt.update(accept_prob);
            if iter >= init_end && iter < slow_end {
                variance.add(&state.theta);
            }
            if iter + 1 == slow_end && slow_end > init_end {
                inv_metric = variance.regularized();
                step_size = find_reasonable_step_size(model, &state, &inv_metric, &mut rng);
                adapt = DualAveraging::new(step_size, config.adapt_delta);
                debug!(iteration = iter + 1, step_size, "metric updated");
            }
            if iter + 1 == config.num_warmup {
                step_size = adapt.final_step_size();
            }
        } else {
            thetas.push(state.theta.clone());
            lp.push(state.lp);
        }
    }

    Ok(ChainOutput {
        thetas,
        lp,
        divergent,
        step_size,
    })
}
