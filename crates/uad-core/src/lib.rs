//! Pipelines behind the `uad` binary: partition inspection, the two training
//! regimes, and checkpoint evaluation.

pub mod config;
pub mod pipeline;
pub mod results;
