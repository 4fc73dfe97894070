//! Fit engines
//!
//! The workflow only needs "fit this model to this data, by sampling or by
//! optimization". [`FitEngine`] is that seam; [`NativeEngine`] runs the
//! in-process sampler and optimizer, [`crate::stanrun::CmdStanEngine`]
//! shells out to CmdStan.

use crate::data::DataSet;
use crate::error::Result;
use crate::fit::Fit;
use crate::model::ModelSpec;
use crate::optimize::{optimize, OptimizeConfig};
use crate::sampler::{sample, SampleConfig};

pub trait FitEngine {
    fn name(&self) -> &str;

    fn sample(&self, spec: &ModelSpec, data: &DataSet, config: &SampleConfig) -> Result<Fit>;

    fn optimize(&self, spec: &ModelSpec, data: &DataSet, config: &OptimizeConfig) -> Result<Fit>;
}

/// In-process HMC and L-BFGS.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeEngine;

impl FitEngine for NativeEngine {
    fn name(&self) -> &str {
        "native"
    }

    fn sample(&self, spec: &ModelSpec, data: &DataSet, config: &SampleConfig) -> Result<Fit> {
        let model = spec.bind(data)?;
        sample(&model, config)
    }

    fn optimize(&self, spec: &ModelSpec, data: &DataSet, config: &OptimizeConfig) -> Result<Fit> {
        let model = spec.bind(data)?;
        optimize(&model, config)
    }
}
