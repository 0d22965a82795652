//! Model contract, the batch → tensor bridge, and two reference models.

pub mod bridge;
pub mod contract;
pub mod contrastive;
pub mod encoder;
pub mod vae;
