//! What the training loop and the scorer need from a model.
//!
//! Model internals are free; the controller only relies on these forward
//! contracts.

use burn::prelude::*;

/// Gaussian posterior parameters of a variational model.
#[derive(Debug, Clone)]
pub struct Posterior<B: Backend> {
    /// `(B, latent)`.
    pub mu: Tensor<B, 2>,
    /// `(B, latent)`, log of the variance.
    pub logvar: Tensor<B, 2>,
}

/// Result of a feature-exposing forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput<B: Backend> {
    /// Primary output, e.g. reconstruction logits `(B, C, H, W)`.
    pub output: Tensor<B, 4>,
    /// Intermediate activations, shallowest first.
    pub features: Vec<Tensor<B, 4>>,
    pub posterior: Option<Posterior<B>>,
}

/// `(B, C, H, W)` images → primary output + ordered per-layer features.
pub trait FeatureModel<B: Backend> {
    fn forward_features(&self, images: Tensor<B, 4>) -> ModelOutput<B>;
}

/// Projection and classification heads over `(N, C, H, W)` images.
#[derive(Debug, Clone)]
pub struct ContrastiveOutput<B: Backend> {
    /// `(N, d)`, L2-normalised.
    pub projection: Tensor<B, 2>,
    /// `(N, k)` pretext-class logits.
    pub logits: Tensor<B, 2>,
}

pub trait ContrastiveModel<B: Backend> {
    fn forward_contrastive(&self, images: Tensor<B, 4>) -> ContrastiveOutput<B>;
}

/// Resolve a possibly negative layer offset: `-1` is the deepest layer,
/// `0` the shallowest.
pub fn layer_index(num_layers: usize, offset: isize) -> anyhow::Result<usize> {
    let idx = if offset < 0 {
        num_layers as isize + offset
    } else {
        offset
    };
    if idx < 0 || idx as usize >= num_layers {
        anyhow::bail!("Layer offset {offset} out of range for {num_layers} feature layers");
    }
    Ok(idx as usize)
}

/// Take the layer at `offset` out of `features`.
pub fn select_layer<B: Backend>(
    mut features: Vec<Tensor<B, 4>>,
    offset: isize,
) -> anyhow::Result<Tensor<B, 4>> {
    let idx = layer_index(features.len(), offset)?;
    Ok(features.swap_remove(idx))
}
