//! Code generation backends
//!
//! Stan is the only target: it is what the CmdStan engine compiles.

pub mod stan;

pub use stan::generate_stan;
