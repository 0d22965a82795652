//! Loss terms of both training regimes, plus the bilinear upsampling shared
//! with the anomaly scorer.
//!
//! All functions are generic over `B: Backend` and return `(1,)` scalar
//! tensors unless stated otherwise.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::TensorData;

/// Numerical floor inside the entropy logarithm.
pub const ENTROPY_EPS: f64 = 1e-12;

/// SimCLR NT-Xent loss.
///
/// # Arguments
/// - `features`: shape `(B, 2, d)`, L2-normalised, the two views of each
///   sample on axis 1
/// - `temperature`: similarity temperature (0.2 in the pretext regime)
///
/// Every one of the `2B` views is classified against the other `2B − 1`
/// views; its positive is the other view of the same sample.
pub fn simclr_loss<B: Backend>(features: Tensor<B, 3>, temperature: f64) -> Tensor<B, 1> {
    let device = features.device();
    let [b, v, d] = features.dims();
    let n = b * v;
    let z = features.reshape([n, d]);

    let sim = z.clone().matmul(z.transpose()).div_scalar(temperature);

    // Exclude self-similarity from the softmax
    let mut eye = vec![0.0f32; n * n];
    for i in 0..n {
        eye[i * n + i] = 1.0;
    }
    let self_mask = Tensor::<B, 2>::from_data(TensorData::new(eye, [n, n]), &device);
    let logits = sim - self_mask.mul_scalar(1e9);

    // Sample-major layout: rows 2k and 2k+1 are positives of each other
    let targets: Vec<i64> = (0..n).map(|i| (i ^ 1) as i64).collect();
    let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets, [n]), &device);

    CrossEntropyLossConfig::new()
        .init(&device)
        .forward(logits, targets)
}

/// Mean cross-entropy of `(N, k)` logits against class indices.
pub fn classification_loss<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    let device = logits.device();
    CrossEntropyLossConfig::new()
        .init(&device)
        .forward(logits, targets)
}

/// Binary cross-entropy with logits summed over all elements and divided by
/// the batch size.
///
/// Uses the stable form `max(x, 0) − x·y + ln(1 + e^{−|x|})`.
pub fn bce_with_logits_sum<B: Backend>(logits: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
    let [batch, _, _, _] = logits.dims();
    let positive = logits.clone().clamp_min(0.0);
    let cross = logits.clone() * targets;
    let softplus = logits.abs().neg().exp().add_scalar(1.0).log();
    (positive - cross + softplus).sum().div_scalar(batch as f64)
}

/// KL divergence of `N(μ, σ²)` from the unit Gaussian, summed over latent
/// dimensions and divided by the batch size.
pub fn kl_divergence<B: Backend>(mu: Tensor<B, 2>, logvar: Tensor<B, 2>) -> Tensor<B, 1> {
    let [batch, _] = mu.dims();
    let inner = logvar.clone().add_scalar(1.0) - mu.powf_scalar(2.0) - logvar.exp();
    inner.sum().mul_scalar(-0.5).div_scalar(batch as f64)
}

/// Mean Shannon entropy of the spatial attention of one feature layer.
///
/// The layer `(B, C, h, w)` is averaged over channels, upsampled bilinearly
/// (aligned corners) to `out_size`, turned into a distribution over pixels
/// by a softmax, and the per-image entropy `−Σ p·ln(p + ε)` is averaged over
/// the batch.
pub fn attention_entropy<B: Backend>(layer: Tensor<B, 4>, out_size: [usize; 2]) -> Tensor<B, 1> {
    let [batch, _, _, _] = layer.dims();
    let cam = upsample_bilinear(layer.mean_dim(1), out_size);
    let flat: Tensor<B, 2> = cam.reshape([batch, out_size[0] * out_size[1]]);
    let p = burn::tensor::activation::softmax(flat, 1);
    let entropy = (p.clone() * p.add_scalar(ENTROPY_EPS).log()).sum_dim(1).neg();
    entropy.mean()
}

/// Bilinear upsampling with aligned corners of `(B, C, h, w)` to
/// `(B, C, H, W)`.
pub fn upsample_bilinear<B: Backend>(x: Tensor<B, 4>, out_size: [usize; 2]) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    if [h, w] == out_size {
        return x;
    }
    interpolate(x, out_size, InterpolateOptions::new(InterpolateMode::Bilinear))
}
