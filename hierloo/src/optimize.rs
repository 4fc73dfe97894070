//! Posterior mode by L-BFGS
//!
//! Maximizes the log density without the Jacobian term, i.e. the mode on the
//! constrained scale. Tolerances mirror CmdStan's `optimize` method.
//!
//! If the density has no finite maximum the optimizer just keeps climbing
//! until a tolerance is met, the line search runs out of finite trial points,
//! or the iteration limit is hit. All of these return a point estimate; only
//! a non-finite starting point is an error.

use crate::error::{Error, Result};
use crate::fit::{Fit, FitOutput, Method, PointEstimate, Termination};
use crate::model::{BoundModel, LogDensity};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

const ARMIJO_C1: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 60;

/// Configuration for mode finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeConfig {
    pub max_iterations: usize,
    /// Stop when the absolute change in the objective falls below this
    pub tol_obj: f64,
    /// Stop when the relative change in the objective falls below this
    pub tol_rel_obj: f64,
    /// Stop when the gradient norm falls below this
    pub tol_grad: f64,
    /// Stop when the step length falls below this
    pub tol_param: f64,
    /// Number of correction pairs kept
    pub history_size: usize,
    /// Largest allowed change of any coordinate in one iteration
    pub max_step: f64,
    pub init_radius: f64,
    pub seed: u64,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            tol_obj: 1e-12,
            tol_rel_obj: 1e4 * f64::EPSILON,
            tol_grad: 1e-8,
            tol_param: 1e-8,
            history_size: 5,
            max_step: 2.0,
            init_radius: 2.0,
            seed: 1234,
        }
    }
}

impl OptimizeConfig {
    /// Same tolerance for objective, gradient and parameter changes.
    pub fn with_tolerance(tol: f64) -> Self {
        Self {
            tol_obj: tol,
            tol_rel_obj: tol,
            tol_grad: tol,
            tol_param: tol,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 || self.history_size == 0 {
            return Err(Error::InvalidConfig(
                "max_iterations and history_size must be positive".to_string(),
            ));
        }
        if !(self.max_step > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "max_step must be positive, got {}",
                self.max_step
            )));
        }
        Ok(())
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// Two-loop recursion; returns the descent direction `-H g` for the
/// minimization problem.
fn lbfgs_direction(grad: &[f64], history: &VecDeque<(Vec<f64>, Vec<f64>)>) -> Vec<f64> {
    let mut q: Vec<f64> = grad.to_vec();
    let mut alphas = Vec::with_capacity(history.len());
    for (s, y) in history.iter().rev() {
        let rho = 1.0 / dot(y, s);
        let alpha = rho * dot(s, &q);
        for (qi, yi) in q.iter_mut().zip(y) {
            *qi -= alpha * yi;
        }
        alphas.push((alpha, rho));
    }
    if let Some((s, y)) = history.back() {
        let gamma = dot(s, y) / dot(y, y);
        q.iter_mut().for_each(|qi| *qi *= gamma);
    }
    for ((s, y), (alpha, rho)) in history.iter().zip(alphas.iter().rev()) {
        let beta = rho * dot(y, &q);
        for (qi, si) in q.iter_mut().zip(s) {
            *qi += (alpha - beta) * si;
        }
    }
    q.iter().map(|v| -v).collect()
}

fn initial_point(model: &BoundModel, config: &OptimizeConfig) -> Vec<f64> {
    let mut rng = ChaCha20Rng::seed_from_u64(config.seed);
    (0..model.dim())
        .map(|_| {
            if config.init_radius > 0.0 {
                rng.gen_range(-config.init_radius..config.init_radius)
            } else {
                0.0
            }
        })
        .collect()
}

/// Find the posterior mode of a bound model.
pub fn optimize(model: &BoundModel, config: &OptimizeConfig) -> Result<Fit> {
    config.validate()?;
    let init = initial_point(model, config);
    optimize_from(model, config, init)
}

/// As [`optimize`], from given unconstrained initial values.
pub fn optimize_from(model: &BoundModel, config: &OptimizeConfig, init: Vec<f64>) -> Result<Fit> {
    config.validate()?;
    let spec = model.spec();
    if init.len() != model.dim() {
        return Err(Error::InvalidInit(format!(
            "expected {} initial values, got {}",
            model.dim(),
            init.len()
        )));
    }

    // minimize f = -log density
    let mut x = init;
    let mut grad = vec![0.0; x.len()];
    let mut f = -model.gradient(&x, false, &mut grad);
    grad.iter_mut().for_each(|g| *g = -*g);
    if !f.is_finite() || grad.iter().any(|g| !g.is_finite()) {
        return Err(Error::InvalidInit(format!(
            "log density is not finite at the initial point of {}",
            spec.name()
        )));
    }
    info!(model = %spec.name(), initial_lp = -f, "optimizing");

    let mut history: VecDeque<(Vec<f64>, Vec<f64>)> = VecDeque::with_capacity(config.history_size);
    let mut termination = Termination::MaxIterations;
    let mut iterations = 0;
    let mut trial_grad = vec![0.0; x.len()];

    while iterations < config.max_iterations {
        iterations += 1;

        let mut direction = lbfgs_direction(&grad, &history);
        let mut slope = dot(&grad, &direction);
        if !(slope < 0.0) {
            history.clear();
            direction = grad.iter().map(|g| -g).collect();
            slope = dot(&grad, &direction);
        }
        let largest = direction.iter().fold(0.0f64, |m, d| m.max(d.abs()));
        if largest > config.max_step {
            let scale = config.max_step / largest;
            direction.iter_mut().for_each(|d| *d *= scale);
            slope *= scale;
        }

        // backtracking Armijo line search over finite trial points
        let mut step = if history.is_empty() && iterations == 1 {
            (1.0 / norm(&grad)).min(1.0)
        } else {
            1.0
        };
        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            let trial: Vec<f64> = x.iter().zip(&direction).map(|(xi, di)| xi + step * di).collect();
            let f_trial = -model.gradient(&trial, false, &mut trial_grad);
            if f_trial.is_finite()
                && trial_grad.iter().all(|g| g.is_finite())
                && f_trial <= f + ARMIJO_C1 * step * slope
            {
                accepted = Some((trial, f_trial));
                break;
            }
            step *= 0.5;
        }

        let Some((x_new, f_new)) = accepted else {
            if history.is_empty() {
                termination = Termination::LineSearchFailed;
                break;
            }
            // retry once along the steepest direction
            history.clear();
            continue;
        };
        let grad_new: Vec<f64> = trial_grad.iter().map(|g| -g).collect();

        let s: Vec<f64> = x_new.iter().zip(&x).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = grad_new.iter().zip(&grad).map(|(a, b)| a - b).collect();
        if dot(&s, &y) > 1e-12 * norm(&s) * norm(&y) {
            if history.len() == config.history_size {
                history.pop_front();
            }
            history.push_back((s.clone(), y));
        }

        let delta = (f - f_new).abs();
        let rel = delta / f.abs().max(f_new.abs()).max(1.0);
        x = x_new;
        f = f_new;
        grad = grad_new;
        debug!(iteration = iterations, lp = -f, step, "optimizer step");

        if delta < config.tol_obj {
            termination = Termination::AbsoluteObjective;
            break;
        }
        if rel < config.tol_rel_obj {
            termination = Termination::RelativeObjective;
            break;
        }
        if norm(&grad) < config.tol_grad {
            termination = Termination::Gradient;
            break;
        }
        if norm(&s) < config.tol_param {
            termination = Termination::Parameter;
            break;
        }
    }

    if !termination.converged() {
        warn!(
            model = %spec.name(),
            iterations,
            ?termination,
            "optimizer stopped without meeting a tolerance"
        );
    }
    info!(model = %spec.name(), lp = -f, iterations, ?termination, "optimization complete");

    let mut values = model.constrain(&x);
    let generated = model.generated(&values);
    values.extend(generated);
    let mut columns = model.param_names();
    columns.extend(model.generated_names());

    Ok(Fit::new(
        spec,
        Method::Optimize,
        "native-lbfgs",
        columns,
        model.dim(),
        FitOutput::Point(PointEstimate {
            values,
            log_density: -f,
            iterations,
            termination,
        }),
        None,
    ))
}
