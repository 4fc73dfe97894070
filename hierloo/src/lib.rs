//! hierloo library.
//!
//! Hierarchical models for grouped binary outcomes (goalkeeper save rates)
//! and a latent-walk binomial series (polling), fit by HMC or L-BFGS in
//! process or through CmdStan, summarized, and compared with PSIS-LOO.

pub mod cache;
pub mod codegen;
pub mod config;
pub mod data;
pub mod datagen;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod fit;
pub mod math;
pub mod model;
pub mod optimize;
pub mod sampler;
pub mod stanrun;
pub mod summary;
pub mod workflow;

pub use error::{Error, Result};
