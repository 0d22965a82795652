//! Models, losses and the training loop for unsupervised anomaly detection.
//!
//! Two training regimes share one controller: a contrastive pretext regime
//! (NT-Xent plus an optional rotation classifier) and a reconstruction regime
//! (VAE reconstruction, KL and an attention-entropy term). Trained models are
//! turned into per-pixel anomaly maps and per-image scores by
//! [`inference::AnomalyScorer`].

pub mod evaluate;
pub mod inference;
pub mod model;
pub mod training;
