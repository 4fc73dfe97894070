//! Diagnostics for fitted models
//!
//! - Approximate leave-one-out cross-validation (PSIS-LOO) and model comparison
//! - MCMC quality metrics (R-hat, ESS, divergences), opt-in

pub mod loo;
pub mod mcmc;

pub use loo::{heldout_elpd, loo_compare, psis_loo, Comparison, ComparisonRow, LooResult};
pub use mcmc::{summarize_mcmc, FitMcmcSummary, FitQuality, ParamMcmcStats};
