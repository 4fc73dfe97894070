//! Declare, fit, summarize, compare
//!
//! [`Workflow`] runs the parameterized pipelines over any [`FitEngine`]:
//! a single fit with its summary table, a sweep over fixed group scales
//! ranked by LOO (and optionally by held-out log predictive density), a
//! logit/probit comparison, and the optimizer run on an improper posterior.

use crate::config::WorkflowConfig;
use crate::data::{DataSet, SaveDataset};
use crate::datagen::Truth;
use crate::diagnostics::loo::{heldout_elpd, loo_compare, psis_loo, Comparison, LooResult};
use crate::engine::FitEngine;
use crate::error::{Error, Result};
use crate::fit::{Fit, Method, Termination};
use crate::model::{Link, ModelSpec, SaveRateSpec, ScalePrior};
use crate::optimize::OptimizeConfig;
use crate::summary::{summarize, with_truth, ParamSummary, SummaryOptions};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A fit together with its summary table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitReport {
    pub fit: Fit,
    pub summaries: Vec<ParamSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleEntry {
    pub tau: f64,
    pub model: String,
    pub loo: LooResult,
    /// Log predictive density of the held-out data, when given
    pub heldout_elpd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleSweep {
    pub entries: Vec<ScaleEntry>,
    pub comparison: Comparison,
}

impl ScaleSweep {
    /// Scale ranked best by LOO.
    pub fn best_by_loo(&self) -> Option<f64> {
        let best = self.comparison.best();
        self.entries.iter().find(|e| e.model == best).map(|e| e.tau)
    }

    /// Scale with the highest held-out log predictive density.
    pub fn best_by_heldout(&self) -> Option<f64> {
        self.entries
            .iter()
            .filter_map(|e| e.heldout_elpd.map(|h| (e.tau, h)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(tau, _)| tau)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkComparison {
    pub models: Vec<(Link, String)>,
    pub comparison: Comparison,
}

/// Scale estimate from one optimizer run on the improper posterior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImproperStep {
    pub tolerance: f64,
    pub tau: f64,
    pub log_density: f64,
    pub iterations: usize,
    pub termination: Termination,
}

pub struct Workflow {
    engine: Box<dyn FitEngine>,
    config: WorkflowConfig,
}

impl Workflow {
    pub fn new(engine: impl FitEngine + 'static, config: WorkflowConfig) -> Self {
        Self {
            engine: Box::new(engine),
            config,
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub fn fit(&self, spec: &ModelSpec, data: &DataSet, method: Method) -> Result<Fit> {
        match method {
            Method::Sample => self.engine.sample(spec, data, &self.config.sample),
            Method::Optimize => self.engine.optimize(spec, data, &self.config.optimize),
        }
    }

    pub fn fit_and_summarize(
        &self,
        spec: &ModelSpec,
        data: &DataSet,
        method: Method,
        truth: Option<&Truth>,
    ) -> Result<FitReport> {
        let fit = self.fit(spec, data, method)?;
        let options = SummaryOptions {
            interval: self.config.interval,
            ..SummaryOptions::default()
        };
        let summaries = summarize(&fit, &options)?;
        let summaries = match truth {
            Some(truth) => with_truth(summaries, truth),
            None => summaries,
        };
        Ok(FitReport { fit, summaries })
    }

    /// PSIS-LOO of a sampled fit with log-likelihood output.
    pub fn loo(&self, fit: &Fit) -> Result<LooResult> {
        let log_lik = fit.log_lik().ok_or_else(|| {
            Error::Loo(format!(
                "{} has no per-observation log-likelihood",
                fit.model().name()
            ))
        })?;
        psis_loo(log_lik)
    }

    /// Fit the fixed-scale logit model once per `tau` and rank the fits.
    pub fn scale_sweep(
        &self,
        data: &SaveDataset,
        taus: &[f64],
        heldout: Option<&SaveDataset>,
    ) -> Result<ScaleSweep> {
        let heldout: Option<DataSet> = heldout
            .map(|h| h.aligned_to(&data.groups).map(DataSet::from))
            .transpose()?;
        let train: DataSet = data.clone().into();

        let mut entries = Vec::with_capacity(taus.len());
        for &tau in taus {
            let spec = ModelSpec::SaveRate(SaveRateSpec::fixed_scale(tau, Link::Logit)).with_log_lik();
            let fit = self.fit(&spec, &train, Method::Sample)?;
            let loo = self.loo(&fit)?;
            let heldout_elpd = match &heldout {
                Some(h) => Some(heldout_elpd(&fit, &spec.bind(h)?)?),
                None => None,
            };
            info!(tau, elpd_loo = loo.elpd_loo, ?heldout_elpd, "scale sweep");
            entries.push(ScaleEntry {
                tau,
                model: spec.name(),
                loo,
                heldout_elpd,
            });
        }

        let named: Vec<(&str, &LooResult)> =
            entries.iter().map(|e| (e.model.as_str(), &e.loo)).collect();
        let comparison = loo_compare(&named)?;
        Ok(ScaleSweep {
            entries,
            comparison,
        })
    }

    /// Fit the estimated-scale model under each link and compare by LOO.
    pub fn link_comparison(&self, data: &SaveDataset, links: &[Link]) -> Result<LinkComparison> {
        let data: DataSet = data.clone().into();
        let mut models = Vec::with_capacity(links.len());
        let mut loos = Vec::with_capacity(links.len());
        for &link in links {
            let spec = ModelSpec::SaveRate(SaveRateSpec::estimated_scale(
                self.config.scale_prior,
                link,
            ))
            .with_log_lik();
            let fit = self.fit(&spec, &data, Method::Sample)?;
            loos.push(self.loo(&fit)?);
            models.push((link, spec.name()));
        }
        let named: Vec<(&str, &LooResult)> = models
            .iter()
            .zip(&loos)
            .map(|((_, name), loo)| (name.as_str(), loo))
            .collect();
        let comparison = loo_compare(&named)?;
        Ok(LinkComparison { models, comparison })
    }

    /// Optimize the estimated-scale model with a flat scale prior at each
    /// tolerance. There is no finite mode, so tighter tolerances only run
    /// further toward the boundary.
    pub fn improper_demo(&self, data: &SaveDataset, tolerances: &[f64]) -> Result<Vec<ImproperStep>> {
        let spec = ModelSpec::SaveRate(SaveRateSpec::estimated_scale(ScalePrior::Flat, Link::Logit));
        let data: DataSet = data.clone().into();
        tolerances
            .iter()
            .map(|&tolerance| {
                let config = OptimizeConfig {
                    tol_obj: tolerance,
                    tol_rel_obj: tolerance,
                    tol_grad: tolerance,
                    tol_param: tolerance,
                    ..self.config.optimize.clone()
                };
                let fit = self.engine.optimize(&spec, &data, &config)?;
                let point = fit
                    .point()
                    .ok_or_else(|| Error::Engine("optimizer returned draws".to_string()))?;
                let tau = fit
                    .mean("tau")
                    .ok_or_else(|| Error::Engine("optimizer output has no tau".to_string()))?;
                info!(tolerance, tau, termination = ?point.termination, "improper posterior");
                Ok(ImproperStep {
                    tolerance,
                    tau,
                    log_density: point.log_density,
                    iterations: point.iterations,
                    termination: point.termination,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Shot;
    use crate::engine::NativeEngine;

    fn identical_groups() -> SaveDataset {
        let mut shots = Vec::new();
        for group in 0..4 {
            for k in 0..10 {
                shots.push(Shot {
                    group,
                    saved: k < 7,
                });
            }
        }
        SaveDataset::new((0..4).map(|j| format!("k{}", j)).collect(), shots).unwrap()
    }

    #[test]
    fn test_loo_requires_log_lik() {
        let mut config = WorkflowConfig::default();
        config.sample.num_warmup = 100;
        config.sample.num_samples = 50;
        let workflow = Workflow::new(NativeEngine, config);
        let data: DataSet = identical_groups().into();
        let fit = workflow
            .fit(&ModelSpec::SaveRate(SaveRateSpec::independent()), &data, Method::Sample)
            .unwrap();
        assert!(matches!(workflow.loo(&fit), Err(Error::Loo(_))));
    }

    #[test]
    fn test_scale_sweep_matches_heldout_keepers_by_name() {
        let train = SaveDataset::parse_csv(
            "keeper,saved\nneuer,1\noblak,0\nneuer,1\noblak,1\nneuer,0\noblak,0\n",
        )
        .unwrap();
        let reversed = SaveDataset::parse_csv("keeper,saved\noblak,1\nneuer,0\noblak,1\nneuer,1\n")
            .unwrap();
        assert_ne!(reversed.groups, train.groups);
        let same_order = reversed.aligned_to(&train.groups).unwrap();

        let mut config = WorkflowConfig::default();
        config.sample.num_warmup = 100;
        config.sample.num_samples = 100;
        let workflow = Workflow::new(NativeEngine, config);
        let taus = [0.5, 1.0];
        let a = workflow.scale_sweep(&train, &taus, Some(&reversed)).unwrap();
        let b = workflow.scale_sweep(&train, &taus, Some(&same_order)).unwrap();
        for (x, y) in a.entries.iter().zip(&b.entries) {
            assert!(x.heldout_elpd.is_some());
            assert_eq!(x.heldout_elpd, y.heldout_elpd);
        }
    }

    #[test]
    fn test_scale_sweep_rejects_other_groups() {
        let workflow = Workflow::new(NativeEngine, WorkflowConfig::default());
        let data = identical_groups();
        let other = SaveDataset::new(
            vec!["x".to_string()],
            vec![Shot { group: 0, saved: true }],
        )
        .unwrap();
        assert!(matches!(
            workflow.scale_sweep(&data, &[0.5], Some(&other)),
            Err(Error::DataContract(_))
        ));
    }

    #[test]
    fn test_improper_demo_reports_each_tolerance() {
        let mut config = WorkflowConfig::default();
        config.optimize.init_radius = 0.0;
        let workflow = Workflow::new(NativeEngine, config);
        let steps = workflow
            .improper_demo(&identical_groups(), &[1e-1, 1e-8])
            .unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.tau >= 0.0 && s.tau.is_finite()));
        assert!(steps[1].tau <= steps[0].tau);
    }
}
