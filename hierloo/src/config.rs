//! Workflow configuration
//!
//! One JSON document carries everything a run needs. Every field has a
//! default, so a config file only lists what it changes:
//!
//! ```json
//! { "seed": 7, "sample": { "num_chains": 2 }, "interval": { "lower": 0.05, "upper": 0.95 } }
//! ```

use crate::datagen::{PollConfig, SaveRateConfig};
use crate::error::Result;
use crate::model::ScalePrior;
use crate::optimize::OptimizeConfig;
use crate::sampler::SampleConfig;
use crate::summary::Interval;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which [`crate::engine::FitEngine`] runs the fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Native,
    CmdStan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Seed for data generation; fits use the seeds in `sample`/`optimize`
    pub seed: u64,
    pub engine: EngineKind,
    /// Compiled models and CmdStan outputs
    pub work_dir: PathBuf,
    pub sample: SampleConfig,
    pub optimize: OptimizeConfig,
    pub interval: Interval,
    pub saves: SaveRateConfig,
    pub polls: PollConfig,
    /// Shots per keeper in the held-out set used to check LOO rankings
    pub heldout_shots: u32,
    /// Fixed scales compared by the scale sweep
    pub scale_grid: Vec<f64>,
    /// Optimizer tolerances used by the improper-posterior demo
    pub improper_tolerances: Vec<f64>,
    /// Prior on the group scale in the link comparison
    pub scale_prior: ScalePrior,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            seed: 2024,
            engine: EngineKind::Native,
            work_dir: PathBuf::from("target/hierloo"),
            sample: SampleConfig::default(),
            optimize: OptimizeConfig::default(),
            interval: Interval::default(),
            saves: SaveRateConfig::default(),
            polls: PollConfig::default(),
            heldout_shots: 200,
            scale_grid: vec![0.1, 0.5, 1.0, 2.0],
            improper_tolerances: vec![1e-1, 1e-4, 1e-8],
            scale_prior: ScalePrior::HalfNormal(1.0),
        }
    }
}

impl WorkflowConfig {
    /// Load a config from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: WorkflowConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.sample.validate()?;
        self.optimize.validate()?;
        self.interval.validate()?;
        self.saves.validate()?;
        self.polls.validate()?;
        Ok(())
    }
}
