//! Tensor bridge: conversions between `cohort` batches (flat `Vec<f32>`
//! buffers) and burn tensors.
//!
//! The data crate knows nothing about burn; everything crossing that
//! boundary goes through here.

use burn::prelude::*;
use burn::tensor::TensorData;
use cohort::Batch;

/// Batch images as a `(B, C, H, W)` tensor.
pub fn batch_images<B: Backend>(batch: &Batch, device: &B::Device) -> Tensor<B, 4> {
    Tensor::from_data(TensorData::new(batch.images.clone(), batch.shape), device)
}

/// Images and augmented views interleaved sample-major into `(2B, C, H, W)`:
/// `x₀, x₀′, x₁, x₁′, …`.
pub fn batch_views<B: Backend>(batch: &Batch, device: &B::Device) -> anyhow::Result<Tensor<B, 4>> {
    let augmented = batch
        .augmented
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("Batch has no augmented views"))?;
    let [b, c, h, w] = batch.shape;
    let images = batch_images::<B>(batch, device);
    let views = Tensor::<B, 4>::from_data(TensorData::new(augmented.clone(), batch.shape), device);
    Ok(Tensor::stack::<5>(vec![images, views], 1).reshape([2 * b, c, h, w]))
}

/// Each label repeated once per view, matching [`batch_views`] order.
pub fn view_labels<B: Backend>(batch: &Batch, device: &B::Device) -> anyhow::Result<Tensor<B, 1, Int>> {
    let labels = batch
        .labels
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("Batch has no labels"))?;
    let doubled: Vec<i64> = labels.iter().flat_map(|&l| [l, l]).collect();
    let n = doubled.len();
    Ok(Tensor::from_data(TensorData::new(doubled, [n]), device))
}

/// Flatten any tensor into host `f32` values in row-major order.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> anyhow::Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("Failed to read tensor data: {e:?}"))
}

/// Read a single-element tensor as `f64`.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}
