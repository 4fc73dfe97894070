//! Fit results
//!
//! A [`Fit`] is produced once per (model, dataset, configuration) and is
//! read-only afterwards. Columns are the model's constrained parameters
//! followed by its generated quantities; per-observation log-likelihoods
//! live in a separate [`LogLikMatrix`] tagged with the dataset fingerprint.

use crate::model::ModelSpec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Sample,
    Optimize,
}

/// Why the optimizer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    AbsoluteObjective,
    RelativeObjective,
    Gradient,
    Parameter,
    MaxIterations,
    LineSearchFailed,
}

impl Termination {
    /// True when one of the convergence tolerances was met.
    pub fn converged(self) -> bool {
        !matches!(
            self,
            Termination::MaxIterations | Termination::LineSearchFailed
        )
    }
}

/// Posterior draws, `chains[c][i][k]` = column `k` of iteration `i` in chain `c`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draws {
    pub chains: Vec<Vec<Vec<f64>>>,
    /// Log density (with Jacobian) of each draw, `lp[c][i]`
    pub lp: Vec<Vec<f64>>,
    pub divergent: usize,
    pub step_sizes: Vec<f64>,
}

impl Draws {
    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn n_draws(&self) -> usize {
        self.chains.iter().map(|c| c.len()).sum()
    }

    /// Rows of all chains, in chain order.
    pub fn rows(&self) -> impl Iterator<Item = &Vec<f64>> {
        self.chains.iter().flatten()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointEstimate {
    pub values: Vec<f64>,
    pub log_density: f64,
    pub iterations: usize,
    pub termination: Termination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FitOutput {
    Draws(Draws),
    Point(PointEstimate),
}

/// Pointwise log-likelihood, `values[s][i]` for draw `s` and observation `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLikMatrix {
    values: Vec<Vec<f64>>,
    n_obs: usize,
    data_fingerprint: String,
}

impl LogLikMatrix {
    pub fn new(values: Vec<Vec<f64>>, n_obs: usize, data_fingerprint: String) -> Self {
        Self {
            values,
            n_obs,
            data_fingerprint,
        }
    }

    pub fn n_draws(&self) -> usize {
        self.values.len()
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn data_fingerprint(&self) -> &str {
        &self.data_fingerprint
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.values
    }

    /// All draws for observation `i`.
    pub fn observation(&self, i: usize) -> Vec<f64> {
        self.values.iter().map(|row| row[i]).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fit {
    model: ModelSpec,
    method: Method,
    engine: String,
    columns: Vec<String>,
    n_params: usize,
    output: FitOutput,
    log_lik: Option<LogLikMatrix>,
}

impl Fit {
    pub fn new(
        model: ModelSpec,
        method: Method,
        engine: impl Into<String>,
        columns: Vec<String>,
        n_params: usize,
        output: FitOutput,
        log_lik: Option<LogLikMatrix>,
    ) -> Self {
        Self {
            model,
            method,
            engine: engine.into(),
            columns,
            n_params,
            output,
            log_lik,
        }
    }

    pub fn model(&self) -> &ModelSpec {
        &self.model
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn output(&self) -> &FitOutput {
        &self.output
    }

    pub fn log_lik(&self) -> Option<&LogLikMatrix> {
        self.log_lik.as_ref()
    }

    pub fn draws(&self) -> Option<&Draws> {
        match &self.output {
            FitOutput::Draws(d) => Some(d),
            FitOutput::Point(_) => None,
        }
    }

    pub fn point(&self) -> Option<&PointEstimate> {
        match &self.output {
            FitOutput::Point(p) => Some(p),
            FitOutput::Draws(_) => None,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Every value of one column: all draws, or the single point value.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.column_index(name)?;
        Some(match &self.output {
            FitOutput::Draws(d) => d.rows().map(|row| row[idx]).collect(),
            FitOutput::Point(p) => vec![p.values[idx]],
        })
    }

    /// Mean of a column across draws (or the point value).
    pub fn mean(&self, name: &str) -> Option<f64> {
        self.column(name).map(|v| crate::math::mean(&v))
    }

    /// Constrained parameter vectors, one per draw (or one for a point fit).
    pub fn parameter_rows(&self) -> Vec<&[f64]> {
        match &self.output {
            FitOutput::Draws(d) => d.rows().map(|row| &row[..self.n_params]).collect(),
            FitOutput::Point(p) => vec![&p.values[..self.n_params]],
        }
    }
}
