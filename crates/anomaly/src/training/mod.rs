//! Training pipeline: loss functions, loss composers, metric sinks,
//! checkpointing and the step/epoch controller.

pub mod checkpoint;
pub mod composer;
pub mod loss;
pub mod metrics;
pub mod trainer;
